use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Factorisation of one loop dimension: `outer * vector * thread * tile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimFactors {
    /// Bound to a block index.
    pub outer: usize,
    /// Iterated per thread, optionally as virtual threads.
    pub vector: usize,
    /// Bound to a thread index.
    pub thread: usize,
    /// Consumed by one matrix-unit instruction.
    pub tile: usize,
}

impl DimFactors {
    pub const fn new(outer: usize, vector: usize, thread: usize, tile: usize) -> Self {
        Self { outer, vector, thread, tile }
    }

    /// `None` when the factors overflow.
    pub fn product(&self) -> Option<usize> {
        self.as_vec().into_iter().try_fold(1usize, |acc, f| acc.checked_mul(f))
    }

    pub fn as_vec(&self) -> Vec<usize> {
        vec![self.outer, self.vector, self.thread, self.tile]
    }
}

/// Explicit factors for batch, output-channel and input-channel loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileFactors {
    pub batch: DimFactors,
    pub out_channels: DimFactors,
    /// Reduction dimension; `thread` must stay 1.
    pub in_channels: DimFactors,
}

impl Default for TileFactors {
    /// Factors of the 256x512x256 reference layer on a 16x16x16 unit.
    fn default() -> Self {
        Self {
            batch: DimFactors::new(4, 2, 2, 16),
            out_channels: DimFactors::new(4, 2, 4, 16),
            in_channels: DimFactors::new(4, 4, 1, 16),
        }
    }
}

impl TileFactors {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub factors: TileFactors,
    /// Bind the vector loops to `vthread`; left as plain serial loops otherwise.
    pub bind_virtual_threads: bool,
    /// Threads along `threadIdx.x` that cooperatively fetch a shared tile.
    pub fetch_lanes: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            factors: TileFactors::default(),
            bind_virtual_threads: false,
            fetch_lanes: 2,
        }
    }
}

impl SynthesisConfig {
    pub fn new(factors: TileFactors) -> Self {
        Self { factors, ..Self::default() }
    }

    pub fn with_virtual_threads(mut self, enabled: bool) -> Self {
        self.bind_virtual_threads = enabled;
        self
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TensorizeError;

    #[test]
    fn test_default_factors_cover_reference_layer() {
        let f = TileFactors::default();
        assert_eq!(f.batch.product(), Some(256));
        assert_eq!(f.out_channels.product(), Some(512));
        assert_eq!(f.in_channels.product(), Some(256));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SynthesisConfig::from_json(r#"{ "bind_virtual_threads": true }"#).unwrap();
        assert!(config.bind_virtual_threads);
        assert_eq!(config.fetch_lanes, 2);
        assert_eq!(config.factors, TileFactors::default());

        let again = SynthesisConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let err = TileFactors::from_json("{ \"batch\": 4 }").unwrap_err();
        assert!(matches!(err, TensorizeError::Config(_)));
    }
}
