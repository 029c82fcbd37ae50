use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::device::HardwareTarget;
use crate::error::{Result, TensorizeError};
use crate::schedule::{Attach, Schedule, Stage, StageId, StageKind, ThreadAxis};
use crate::semantic::fragment::MemoryScope;

/// Grid and block extents, `[x, y, z]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchDims {
    pub grid: [usize; 3],
    pub block: [usize; 3],
}

impl LaunchDims {
    pub fn threads_per_block(&self) -> usize {
        self.block.iter().product()
    }

    pub fn blocks(&self) -> usize {
        self.grid.iter().product()
    }
}

fn invalid(msg: String) -> TensorizeError {
    TensorizeError::InvalidSchedule(msg)
}

fn is_live(stage: &Stage) -> bool {
    stage.kind == StageKind::Compute && stage.attach != Attach::Inline
}

/// Bindings enclosing the first `leaves` leaves of `stage`, outermost first,
/// through every attach point above it.
fn binding_chain(sch: &Schedule, stage: StageId, leaves: usize) -> Vec<(String, ThreadAxis)> {
    let s = sch.stage(stage);
    let mut chain = match s.attach {
        Attach::At { stage: target, loop_id } => {
            let t = sch.stage(target);
            binding_chain(sch, target, t.position(loop_id).map_or(0, |p| p + 1))
        }
        _ => Vec::new(),
    };
    chain.extend(own_bindings(s, leaves));
    chain
}

fn own_bindings(s: &Stage, leaves: usize) -> Vec<(String, ThreadAxis)> {
    s.leaves[..leaves.min(s.leaves.len())]
        .iter()
        .filter_map(|&l| {
            let lp = s.get_loop(l);
            lp.binding.map(|axis| (format!("{}.{}", s.name, lp.name), axis))
        })
        .collect()
}

/// Checks the whole schedule and derives its launch configuration.
pub fn validate(sch: &Schedule, target: &HardwareTarget) -> Result<LaunchDims> {
    let mut extents: BTreeMap<&'static str, (usize, String)> = BTreeMap::new();

    for (i, s) in sch.stages().iter().enumerate() {
        if !is_live(s) {
            continue;
        }
        let id = StageId(i);

        for &leaf in &s.leaves {
            let lp = s.get_loop(leaf);
            let axis = match lp.binding {
                Some(ThreadAxis::VThread) | None => continue,
                Some(axis) => axis,
            };
            let site = format!("{}.{}", s.name, lp.name);
            match extents.get(axis.name()) {
                Some((extent, other)) if *extent != lp.extent => {
                    return Err(invalid(format!(
                        "{} has extent {} at `{}` but {} at `{}`",
                        axis, extent, other, lp.extent, site
                    )));
                }
                Some(_) => {}
                None => {
                    extents.insert(axis.name(), (lp.extent, site));
                }
            }
        }

        let chain = binding_chain(sch, id, s.leaves.len());
        if let Some(first_thread) = chain.iter().position(|(_, axis)| axis.is_thread()) {
            if let Some((site, axis)) = chain[first_thread..].iter().find(|(_, axis)| axis.is_block()) {
                return Err(invalid(format!(
                    "{} at `{}` is nested inside thread binding `{}`",
                    axis, site, chain[first_thread].0
                )));
            }
        }

        if s.scope.is_fragment() {
            if s.tensorized.is_none() {
                return Err(invalid(format!("fragment stage `{}` must be tensorized", s.name)));
            }
            for access in &s.reads {
                let producer = sch.stage(access.tensor);
                if producer.scope == MemoryScope::Shared && !sch.has_barrier(access.tensor, id) {
                    return Err(invalid(format!(
                        "`{}` reads shared `{}` without a barrier",
                        s.name, producer.name
                    )));
                }
            }
        }
        let reads_fragment = s.reads.iter().any(|a| sch.stage(a.tensor).scope.is_fragment());
        if reads_fragment && s.tensorized.is_none() {
            return Err(invalid(format!("`{}` reads a fragment and must be tensorized", s.name)));
        }
    }

    let extent = |axis: ThreadAxis| extents.get(axis.name()).map_or(1, |(e, _)| *e);
    let launch = LaunchDims {
        grid: [extent(ThreadAxis::BlockX), extent(ThreadAxis::BlockY), extent(ThreadAxis::BlockZ)],
        block: [extent(ThreadAxis::ThreadX), extent(ThreadAxis::ThreadY), extent(ThreadAxis::ThreadZ)],
    };
    if launch.threads_per_block() > target.max_threads_per_block {
        return Err(invalid(format!(
            "{} threads per block exceed the {} limit of {}",
            launch.threads_per_block(),
            target.name,
            target.max_threads_per_block
        )));
    }
    debug!("[Schedule] Validated: grid {:?}, block {:?}", launch.grid, launch.block);
    Ok(launch)
}
