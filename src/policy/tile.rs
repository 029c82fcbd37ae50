use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::config::{DimFactors, SynthesisConfig};
use crate::core::device::HardwareTarget;
use crate::core::dtype::DType;
use crate::core::op::Conv2dOp;
use crate::error::{Result, TensorizeError};

/// Loop extents the planner factorises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemExtents {
    pub batch: usize,
    pub out_channels: usize,
    pub in_channels: usize,
}

impl ProblemExtents {
    pub fn of(op: &Conv2dOp) -> Self {
        Self {
            batch: op.batch,
            out_channels: op.out_channels,
            in_channels: op.in_channels,
        }
    }
}

/// A checked factorisation, ready for the synthesizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilePlan {
    pub batch: DimFactors,
    pub out_channels: DimFactors,
    pub in_channels: DimFactors,
    pub fetch_lanes: usize,
    pub threads_per_block: usize,
    /// Shared bytes staged per reduction step (image tile + filter tile).
    pub shared_bytes: usize,
}

impl TilePlan {
    /// Elements of one shared tile along the reduction dimension.
    pub fn reduction_step(&self) -> usize {
        self.in_channels.vector * self.in_channels.tile
    }
}

pub struct TilePlanner {
    target: HardwareTarget,
    dtype: DType,
}

impl TilePlanner {
    pub fn new(target: HardwareTarget, dtype: DType) -> Self {
        Self { target, dtype }
    }

    pub fn target(&self) -> &HardwareTarget {
        &self.target
    }

    /// Checks the configured factors against the extents and the target.
    ///
    /// Every violation is reported eagerly as `InfeasibleFactorization`.
    pub fn plan(&self, extents: ProblemExtents, config: &SynthesisConfig) -> Result<TilePlan> {
        let f = &config.factors;
        let tile = self.target.tile;
        check_dim("batch", &f.batch, extents.batch, tile.m)?;
        check_dim("out_channels", &f.out_channels, extents.out_channels, tile.n)?;
        check_dim("in_channels", &f.in_channels, extents.in_channels, tile.k)?;
        if f.in_channels.thread != 1 {
            return Err(infeasible(
                "in_channels",
                &f.in_channels,
                extents.in_channels,
                "the reduction dimension cannot be spread across threads".into(),
            ));
        }

        // Each shared tile row block is fetched by threadIdx.z * threadIdx.y,
        // each row by `fetch_lanes` threads along threadIdx.x.
        let fetchers = f.batch.thread * f.out_channels.thread;
        for (dim, factors, total) in [
            ("batch", &f.batch, extents.batch),
            ("out_channels", &f.out_channels, extents.out_channels),
        ] {
            if factors.tile % fetchers != 0 {
                return Err(infeasible(
                    dim,
                    factors,
                    total,
                    format!("tile {} cannot be fetched by {} thread rows", factors.tile, fetchers),
                ));
            }
        }
        let step = f.in_channels.vector * f.in_channels.tile;
        if config.fetch_lanes == 0 || step % config.fetch_lanes != 0 {
            return Err(infeasible(
                "in_channels",
                &f.in_channels,
                extents.in_channels,
                format!("reduction step {} cannot be split across {} fetch lanes", step, config.fetch_lanes),
            ));
        }

        let threads_per_block = fetchers * config.fetch_lanes;
        if threads_per_block > self.target.max_threads_per_block {
            return Err(infeasible(
                "threads",
                &f.batch,
                extents.batch,
                format!(
                    "{} threads per block exceed the {} limit of {}",
                    threads_per_block, self.target.name, self.target.max_threads_per_block
                ),
            ));
        }

        let elements = (f.batch.tile + f.out_channels.tile) * step;
        let shared_bytes = (elements * self.dtype.bits() as usize + 7) / 8;
        if shared_bytes > self.target.shared_memory_bytes {
            return Err(infeasible(
                "in_channels",
                &f.in_channels,
                extents.in_channels,
                format!(
                    "{} bytes of shared memory per step exceed the {} budget of {}",
                    shared_bytes, self.target.name, self.target.shared_memory_bytes
                ),
            ));
        }

        debug!(
            "[Planner] N={:?} K={:?} C={:?} -> {} threads/block, {} shared bytes",
            f.batch.as_vec(),
            f.out_channels.as_vec(),
            f.in_channels.as_vec(),
            threads_per_block,
            shared_bytes
        );
        Ok(TilePlan {
            batch: f.batch,
            out_channels: f.out_channels,
            in_channels: f.in_channels,
            fetch_lanes: config.fetch_lanes,
            threads_per_block,
            shared_bytes,
        })
    }
}

fn infeasible(dim: &str, factors: &DimFactors, total: usize, reason: String) -> TensorizeError {
    TensorizeError::InfeasibleFactorization {
        dim: dim.to_string(),
        factors: factors.as_vec(),
        total,
        reason,
    }
}

fn check_dim(dim: &str, factors: &DimFactors, total: usize, hw_tile: usize) -> Result<()> {
    if factors.as_vec().contains(&0) {
        return Err(infeasible(dim, factors, total, "factors must be positive".into()));
    }
    if factors.tile != hw_tile {
        return Err(infeasible(
            dim,
            factors,
            total,
            format!("tile {} differs from the hardware tile {}", factors.tile, hw_tile),
        ));
    }
    match factors.product() {
        Some(product) if product == total => {}
        Some(product) => {
            return Err(infeasible(dim, factors, total, format!("product {} does not cover the extent", product)));
        }
        None => return Err(infeasible(dim, factors, total, "product overflows".into())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TileFactors;

    fn reference() -> ProblemExtents {
        ProblemExtents { batch: 256, out_channels: 512, in_channels: 256 }
    }

    #[test]
    fn test_reference_plan() {
        let planner = TilePlanner::new(HardwareTarget::volta(), DType::Float16);
        let plan = planner.plan(reference(), &SynthesisConfig::default()).unwrap();
        assert_eq!(plan.threads_per_block, 16);
        assert_eq!(plan.reduction_step(), 64);
        assert_eq!(plan.shared_bytes, 4096);
    }

    #[test]
    fn test_reduction_threads_rejected() {
        let planner = TilePlanner::new(HardwareTarget::volta(), DType::Float16);
        let mut factors = TileFactors::default();
        factors.in_channels = DimFactors::new(2, 4, 2, 16);
        let err = planner.plan(reference(), &SynthesisConfig::new(factors)).unwrap_err();
        assert!(matches!(err, TensorizeError::InfeasibleFactorization { dim, .. } if dim == "in_channels"));
    }

    #[test]
    fn test_shared_budget() {
        let mut target = HardwareTarget::volta();
        target.shared_memory_bytes = 2048;
        let planner = TilePlanner::new(target, DType::Float16);
        let err = planner.plan(reference(), &SynthesisConfig::default()).unwrap_err();
        assert!(matches!(err, TensorizeError::InfeasibleFactorization { reason, .. } if reason.contains("shared memory")));
    }
}
