use std::collections::BTreeMap;

use crate::error::{Result, TensorizeError};
use crate::schedule::{Attach, LoopId, LoopOrigin, Schedule, Stage, StageId};
use crate::te::{Affine, IterKind};

/// Extent each root axis of `target` sweeps during one iteration of leaf `at`.
///
/// Roots untouched by the inner leaves are fixed and left out of the map.
pub fn inner_extents(target: &Stage, at: LoopId) -> Result<BTreeMap<String, usize>> {
    let pos = target.position(at).ok_or_else(|| {
        TensorizeError::InvalidSchedule(format!("`{}` is not a leaf of `{}`", target.get_loop(at).name, target.name))
    })?;
    let mut sweep = vec![1usize; target.roots.len()];
    for &leaf in &target.leaves[pos + 1..] {
        for (root, extent) in root_extents(target, leaf) {
            sweep[root] *= extent;
        }
    }
    Ok(target
        .roots
        .iter()
        .zip(sweep)
        .filter(|(_, s)| *s > 1)
        .map(|(root, s)| (root.name.clone(), s.min(root.extent)))
        .collect())
}

/// `(root, extent)` contributions of one loop.
fn root_extents(stage: &Stage, id: LoopId) -> Vec<(usize, usize)> {
    let lp = stage.get_loop(id);
    match lp.origin {
        LoopOrigin::Fused(outer, inner) => {
            let mut out = root_extents(stage, outer);
            out.extend(root_extents(stage, inner));
            out
        }
        _ => stage.roots_of(id).into_iter().map(|root| (root, lp.extent)).collect(),
    }
}

/// Every access to `producer` from inside one iteration of `at`, rewritten
/// over the root axes of `target`.
///
/// Consumers attached at `target` are followed through their own accesses;
/// their reduction axes become extra variables swept in full.
fn project(
    sch: &Schedule,
    producer: StageId,
    target: StageId,
    at_pos: usize,
    extents: &mut BTreeMap<String, usize>,
) -> Result<Vec<Vec<Affine>>> {
    let consumers = sch.consumers(producer);
    if consumers.is_empty() {
        return Err(TensorizeError::InvalidSchedule(format!(
            "`{}` has no consumer to be computed for",
            sch.stage(producer).name
        )));
    }

    let mut paths = Vec::new();
    for consumer in consumers {
        let c = sch.stage(consumer);
        let accesses = c.reads.iter().filter(|a| a.tensor == producer);
        if consumer == target {
            paths.extend(accesses.map(|a| a.indices.clone()));
            continue;
        }

        match c.attach {
            Attach::At { stage, loop_id } if stage == target => {
                let pos = sch.stage(target).position(loop_id).unwrap_or(0);
                if pos < at_pos {
                    return Err(TensorizeError::InvalidSchedule(format!(
                        "consumer `{}` of `{}` is attached outside `{}`",
                        c.name,
                        sch.stage(producer).name,
                        sch.stage(target).get_loop(loop_id).name
                    )));
                }
            }
            _ => {
                return Err(TensorizeError::InvalidSchedule(format!(
                    "consumer `{}` of `{}` must be attached inside `{}` first",
                    c.name,
                    sch.stage(producer).name,
                    sch.stage(target).name
                )))
            }
        }

        let outer = project(sch, consumer, target, at_pos, extents)?;
        for indices in outer {
            let mut map = BTreeMap::new();
            for (root, index) in c.data_axes().zip(indices) {
                map.insert(root.name.clone(), index);
            }
            for root in c.roots.iter().filter(|r| r.kind == IterKind::Reduce) {
                let local = format!("{}/{}", c.name, root.name);
                extents.insert(local.clone(), root.extent);
                map.insert(root.name.clone(), Affine::var(&local));
            }
            for access in c.reads.iter().filter(|a| a.tensor == producer) {
                paths.push(access.indices.iter().map(|e| e.substitute(&map)).collect());
            }
        }
    }
    Ok(paths)
}

/// Buffer extents `stage` needs when computed inside loop `at` of `target`.
pub fn infer_region(sch: &Schedule, stage: StageId, target: StageId, at: LoopId) -> Result<Vec<usize>> {
    let t = sch.stage(target);
    let mut extents = inner_extents(t, at)?;
    let at_pos = t.position(at).unwrap_or(0);
    let paths = project(sch, stage, target, at_pos, &mut extents)?;

    let s = sch.stage(stage);
    let full = s.region();
    let mut region = vec![1usize; full.len()];
    for indices in &paths {
        if indices.len() != full.len() {
            return Err(TensorizeError::ShapeMismatch {
                context: format!("access to `{}`", s.name),
                expected: format!("{} indices", full.len()),
                actual: format!("{}", indices.len()),
            });
        }
        for (dim, index) in indices.iter().enumerate() {
            region[dim] = region[dim].max(index.span(&extents));
        }
    }
    Ok(region.into_iter().zip(full).map(|(r, f)| r.min(f)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dtype::DType;
    use crate::semantic::fragment::MemoryScope;
    use crate::te::{compute, placeholder, reduce_axis, sum};

    #[test]
    fn test_region_of_tiled_matmul_operand() {
        let a = placeholder(&[64, 32], DType::Float16, "A");
        let b = placeholder(&[32, 48], DType::Float16, "B");
        let k = reduce_axis(32, "k");
        let c = compute(&[64, 48], "C", |ax| {
            sum(
                a.load(vec![ax[0].clone(), k.expr()]) * b.load(vec![k.expr(), ax[1].clone()]),
                &[k.clone()],
            )
        });
        let mut sch = Schedule::create(&[&c]).unwrap();
        let cs = sch.stage_of(&c).unwrap();
        let a_stage = sch.stage_of(&a).unwrap();
        let shared = sch.cache_read(a_stage, MemoryScope::Shared, &[cs]).unwrap();

        let i = sch.axis(cs, 0).unwrap();
        let (io, ii) = sch.split(cs, i, 4).unwrap();
        let kk = sch.reduce_axis(cs, 0).unwrap();
        let (ko, ki) = sch.split(cs, kk, 2).unwrap();
        let j = sch.axis(cs, 1).unwrap();
        sch.reorder(cs, &[io, ko, j, ii, ki]).unwrap();

        let region = infer_region(&sch, shared, cs, ko).unwrap();
        assert_eq!(region, vec![16, 16]);
        let region = infer_region(&sch, shared, cs, io).unwrap();
        assert_eq!(region, vec![16, 32]);
    }

    #[test]
    fn test_unattached_consumer_is_rejected() {
        let a = placeholder(&[8], DType::Float32, "A");
        let b = compute(&[8], "B", |ax| a.load(vec![ax[0].clone()]));
        let c = compute(&[8], "C", |ax| b.load(vec![ax[0].clone()]));
        let d = compute(&[8], "D", |ax| b.load(vec![ax[0].clone()]) + c.load(vec![ax[0].clone()]));
        let sch = Schedule::create(&[&d]).unwrap();
        let (bs, ds) = (sch.stage_of(&b).unwrap(), sch.stage_of(&d).unwrap());
        let at = sch.axis(ds, 0).unwrap();
        let err = infer_region(&sch, bs, ds, at).unwrap_err();
        assert!(matches!(err, TensorizeError::InvalidSchedule(msg) if msg.contains("`C`")));
    }
}
