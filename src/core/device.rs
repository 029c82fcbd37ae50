use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Fixed `M x N x K` shape of one matrix-unit instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl TileShape {
    pub const fn new(m: usize, n: usize, k: usize) -> Self {
        Self { m, n, k }
    }
}

impl Default for TileShape {
    fn default() -> Self {
        Self::new(16, 16, 16)
    }
}

/// The accelerator a schedule is synthesized for.
///
/// Replaces module-level tile constants so that targets with different
/// matrix-unit shapes can be planned side by side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareTarget {
    pub name: String, // "sm_70", "sm_80"
    pub tile: TileShape,

    // Compute Capabilities
    pub max_threads_per_block: usize,
    pub warp_size: usize,
    pub shared_memory_bytes: usize,

    pub has_tensor_cores: bool,
}

impl HardwareTarget {
    /// Volta-class part with 16x16x16 half-precision fragments.
    pub fn volta() -> Self {
        Self {
            name: "sm_70".to_string(),
            tile: TileShape::new(16, 16, 16),
            max_threads_per_block: 1024,
            warp_size: 32,
            shared_memory_bytes: 49152,
            has_tensor_cores: true,
        }
    }

    pub fn ampere() -> Self {
        Self {
            name: "sm_80".to_string(),
            tile: TileShape::new(16, 16, 16),
            max_threads_per_block: 1024,
            warp_size: 32,
            shared_memory_bytes: 166912,
            has_tensor_cores: true,
        }
    }

    pub fn with_tile(mut self, tile: TileShape) -> Self {
        self.tile = tile;
        self
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl Default for HardwareTarget {
    fn default() -> Self {
        Self::volta()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_json() {
        let json = r#"{
            "name": "sm_75",
            "tile": { "m": 16, "n": 16, "k": 16 },
            "max_threads_per_block": 1024,
            "warp_size": 32,
            "shared_memory_bytes": 65536,
            "has_tensor_cores": true
        }"#;
        let target = HardwareTarget::from_json(json).unwrap();
        assert_eq!(target.name, "sm_75");
        assert_eq!(target.tile, TileShape::default());
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let err = HardwareTarget::from_json("{ \"name\": 3 }").unwrap_err();
        assert!(matches!(err, crate::error::TensorizeError::Config(_)));
    }
}
