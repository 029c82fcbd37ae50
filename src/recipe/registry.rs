use std::collections::BTreeMap;
use std::fmt;

use tracing::info;

use crate::core::dtype::DType;
use crate::error::{Result, TensorizeError};
use crate::recipe::conv::{TenetConvRecipe, FAMILY};
use crate::recipe::CompilationRecipe;

pub type RecipeFactory = Box<dyn Fn() -> Result<Box<dyn CompilationRecipe>> + Send + Sync>;

struct Entry {
    family: String,
    factory: RecipeFactory,
}

/// Recipes available to the synthesizer, keyed by unique name.
///
/// Populated once at startup and read-only afterwards.
#[derive(Default)]
pub struct RecipeRegistry {
    entries: BTreeMap<String, Entry>,
}

/// `(operand, output)` pairs of the built-in conv variants.
const CONV_VARIANTS: [(DType, DType); 8] = [
    (DType::Float16, DType::Float16),
    (DType::Float16, DType::Float32),
    (DType::BFloat16, DType::Float32),
    (DType::Float32, DType::Float32),
    (DType::Float64, DType::Float64),
    (DType::Int8, DType::Int32),
    (DType::Int4, DType::Int32),
    (DType::Bool, DType::Int32),
];

impl RecipeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every `tenet conv` variant.
    pub fn with_builtin() -> Result<Self> {
        let mut registry = Self::new();
        for (operand, output) in CONV_VARIANTS {
            let name = TenetConvRecipe::new(operand, output)?.name().to_string();
            registry.register(
                FAMILY,
                &name,
                Box::new(move || Ok(Box::new(TenetConvRecipe::new(operand, output)?) as Box<dyn CompilationRecipe>)),
            )?;
        }
        info!("[Recipe] Registered {} built-in recipes", registry.entries.len());
        Ok(registry)
    }

    pub fn register(&mut self, family: &str, name: &str, factory: RecipeFactory) -> Result<()> {
        if self.entries.contains_key(name) {
            return Err(TensorizeError::DuplicateRecipe(name.to_string()));
        }
        self.entries.insert(
            name.to_string(),
            Entry { family: family.to_string(), factory },
        );
        Ok(())
    }

    /// Constructs a fresh instance of the named recipe.
    pub fn lookup(&self, name: &str) -> Result<Box<dyn CompilationRecipe>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| TensorizeError::UnknownRecipe(name.to_string()))?;
        (entry.factory)()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn family(&self, family: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.family == family)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

impl fmt::Debug for RecipeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecipeRegistry").field("names", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_variants() {
        let registry = RecipeRegistry::with_builtin().unwrap();
        assert_eq!(registry.names().len(), 8);
        assert_eq!(registry.family("tenet conv").len(), 8);
        let recipe = registry.lookup("tenet_conv_fp16_fp16").unwrap();
        assert_eq!(recipe.family(), "tenet conv");
        assert!(registry.names().contains(&"tenet_conv_bool_int32"));
    }

    #[test]
    fn test_lookup_and_duplicates() {
        let mut registry = RecipeRegistry::with_builtin().unwrap();
        assert!(matches!(
            registry.lookup("tenet_conv_fp8_fp8"),
            Err(TensorizeError::UnknownRecipe(_))
        ));
        let err = registry
            .register(
                "tenet conv",
                "tenet_conv_fp16_fp16",
                Box::new(|| Ok(Box::new(TenetConvRecipe::fp16_fp16()?) as Box<dyn CompilationRecipe>)),
            )
            .unwrap_err();
        assert_eq!(err, TensorizeError::DuplicateRecipe("tenet_conv_fp16_fp16".into()));
    }
}
