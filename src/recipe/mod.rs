//! # Compilation Recipes
//!
//! A recipe decomposes one operator variant into a DAG of capsules. It owns
//! the capsule table, the read graph between capsule keys, the per-key dtype
//! tables and the hardware target whose tile the intrinsics are bound to.
//!
//! - **[`conv`]:** the `tenet conv` family and its dtype variants.
//! - **[`dag`]:** the explicit arena/topological-sort DAG builder.
//! - **[`registry`]:** name → factory lookup, populated at startup.

pub mod conv;
pub mod dag;
pub mod registry;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::capsule::{CapsuleKind, Intrinsic};
use crate::core::device::{HardwareTarget, TileShape};
use crate::core::dtype::DType;
use crate::core::shape::ShapeKey;
use crate::error::Result;
use crate::semantic::fragment::{FragmentLayout, MemoryScope};
use crate::te::Tensor;

pub use conv::TenetConvRecipe;
pub use dag::ComputeDag;
pub use registry::RecipeRegistry;

/// Read graph: capsule key → keys of the tensors it consumes, in operand order.
///
/// The raw operator inputs appear as the leaf keys `a` and `b`.
pub type EdgeMap = BTreeMap<String, Vec<String>>;

/// Per-call overrides for [`CompilationRecipe::intrinsic`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntrinsicOptions {
    /// Stride between rows of the staging buffer, in elements.
    pub leading_dimension: Option<usize>,
    pub layout: Option<String>,
    /// Instruction tile; the recipe's hardware tile when unset.
    pub tile: Option<TileShape>,
}

impl IntrinsicOptions {
    pub fn with_leading_dimension(mut self, ldm: usize) -> Self {
        self.leading_dimension = Some(ldm);
        self
    }

    pub fn with_layout(mut self, tag: &str) -> Self {
        self.layout = Some(tag.to_string());
        self
    }

    pub fn with_tile(mut self, tile: TileShape) -> Self {
        self.tile = Some(tile);
        self
    }
}

/// Buffer attributes the backend reports when it realizes a fragment scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeAttributes {
    pub layout: Option<FragmentLayout>,
    pub leading_dimension: Option<usize>,
}

/// Declaration of a buffer living in a fragment scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRealization {
    /// Backend type of one fragment.
    pub type_name: String,
    /// Fragments the buffer holds.
    pub count: usize,
}

/// One operator variant, decomposed into capsules.
///
/// Shape keys are the textual `KxPxQxCxRxS` form; every method parses and
/// validates the key before doing anything else.
pub trait CompilationRecipe: Send + Sync {
    fn name(&self) -> &str;

    fn family(&self) -> &str;

    fn target(&self) -> &HardwareTarget;

    /// Key of the capsule whose expression defines the operator.
    fn anchor(&self) -> CapsuleKind;

    fn edges(&self) -> &EdgeMap;

    fn all_shape_keys(&self) -> Vec<String>;

    fn all_compute_keys(&self) -> Vec<String>;

    fn input_dtypes(&self, key: &str) -> Result<&[DType]>;

    fn output_dtypes(&self, key: &str) -> Result<&[DType]>;

    fn problem_size(&self, shape_key: &str) -> Result<ShapeKey> {
        ShapeKey::parse(shape_key)
    }

    /// The anchor capsule alone, over fresh placeholders.
    fn main_compute_expression(&self, shape_key: &str) -> Result<(Vec<Tensor>, Tensor)>;

    fn capsule_compute_expression(&self, shape_key: &str, capsule_key: &str) -> Result<(Vec<Tensor>, Tensor)>;

    /// A copy capsule over a custom tile of its operand.
    fn capsule_compute_expression_with_shape(
        &self,
        shape_key: &str,
        capsule_key: &str,
        input_shapes: &[Vec<usize>],
        output_shapes: &[Vec<usize>],
    ) -> Result<(Vec<Tensor>, Tensor)>;

    fn dag_compute_expression_with_inputs(
        &self,
        shape_key: &str,
        capsule_keys: &[&str],
        edges: &EdgeMap,
    ) -> Result<ComputeDag>;

    fn intrinsic(&self, shape_key: &str, capsule_key: &str, options: &IntrinsicOptions) -> Result<Intrinsic>;

    fn memory_scope_realize(
        &self,
        dtype: DType,
        scope: MemoryScope,
        elements: usize,
        attributes: &ScopeAttributes,
    ) -> Result<ScopeRealization>;
}
