use tracing::{debug, info};

use crate::core::config::{DimFactors, SynthesisConfig};
use crate::core::device::HardwareTarget;
use crate::core::op::Conv2dOp;
use crate::error::{Result, TensorizeError};
use crate::policy::tile::{ProblemExtents, TilePlan, TilePlanner};
use crate::recipe::{CompilationRecipe, IntrinsicOptions, ScopeAttributes};
use crate::schedule::validate::validate;
use crate::schedule::{FragmentDecl, LoopId, LoweringInput, Schedule, StageId, ThreadAxis};
use crate::semantic::fragment::{FragmentRole, MemoryScope};

/// Builds the global → shared → fragment schedule of a direct convolution.
///
/// Capsule intrinsics come from the recipe; tile factors from the config.
pub struct ScheduleSynthesizer<'a> {
    recipe: &'a dyn CompilationRecipe,
    target: HardwareTarget,
    config: SynthesisConfig,
}

/// Staging stages of one operand or of the output.
struct Staged {
    shared: StageId,
    fragment: StageId,
}

/// Loops of one `(outer, vector, thread, tile)` split.
struct Tiled {
    outer: LoopId,
    vector: LoopId,
    thread: LoopId,
    tile: LoopId,
}

impl<'a> ScheduleSynthesizer<'a> {
    pub fn new(recipe: &'a dyn CompilationRecipe, target: HardwareTarget, config: SynthesisConfig) -> Self {
        Self { recipe, target, config }
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    fn check_recipe(&self, op: &Conv2dOp) -> Result<()> {
        let name = self.recipe.name();
        let operand = self.recipe.input_dtypes("load_a")?[0];
        let accumulator = self.recipe.output_dtypes(self.recipe.anchor().key())?[0];
        let output = self.recipe.output_dtypes("store")?[0];
        if operand != op.dtype || output != op.out_dtype || accumulator != op.dtype.accumulator() {
            return Err(TensorizeError::UnsupportedDtype(format!(
                "`{}` computes {} -> {} -> {} but {} is {} -> {} -> {}",
                name,
                operand,
                accumulator,
                output,
                op.name,
                op.dtype,
                op.dtype.accumulator(),
                op.out_dtype
            )));
        }
        let tile = self.recipe.target().tile;
        if tile != self.target.tile {
            return Err(TensorizeError::ShapeMismatch {
                context: format!("instruction tile of `{}` on {}", name, self.target.name),
                expected: format!("{:?}", self.target.tile),
                actual: format!("{:?}", tile),
            });
        }
        Ok(())
    }

    fn tile_loop(sch: &mut Schedule, stage: StageId, id: LoopId, f: &DimFactors) -> Result<Tiled> {
        let (outer, rest) = sch.split(stage, id, f.outer)?;
        let (vector, rest) = sch.split(stage, rest, f.vector)?;
        let (thread, tile) = sch.split(stage, rest, f.thread)?;
        Ok(Tiled { outer, vector, thread, tile })
    }

    /// Spreads a shared tile over the block: rows across `threadIdx.z` and
    /// `threadIdx.y`, the reduction axis across `threadIdx.x`.
    fn cooperative_fetch(&self, sch: &mut Schedule, stage: StageId, plan: &TilePlan) -> Result<()> {
        let (rows, cols) = (sch.axis(stage, 0)?, sch.axis(stage, 1)?);
        let (h, w) = (sch.axis(stage, 2)?, sch.axis(stage, 3)?);
        let (tz, rest) = sch.split(stage, rows, plan.batch.thread)?;
        let (ty, serial) = sch.split(stage, rest, plan.out_channels.thread)?;
        let (tx, lane) = sch.split(stage, cols, plan.fetch_lanes)?;
        sch.reorder(stage, &[h, w, tz, ty, tx, serial, lane])?;
        sch.bind(stage, tz, ThreadAxis::ThreadZ)?;
        sch.bind(stage, ty, ThreadAxis::ThreadY)?;
        sch.bind(stage, tx, ThreadAxis::ThreadX)?;
        Ok(())
    }

    /// Elements between consecutive rows of a staged buffer.
    fn row_stride(sch: &Schedule, stage: StageId) -> usize {
        sch.stage(stage).region().iter().skip(1).product()
    }

    fn options(&self, ldm: Option<usize>) -> IntrinsicOptions {
        let options = IntrinsicOptions::default().with_tile(self.target.tile);
        match ldm {
            Some(ldm) => options.with_leading_dimension(ldm),
            None => options,
        }
    }

    fn fragments(&self, sch: &Schedule) -> Result<Vec<FragmentDecl>> {
        let mut decls = Vec::new();
        for stage in sch.stages().iter().filter(|s| s.scope.is_fragment()) {
            let intrinsic = stage.tensorized.as_ref().map(|t| &t.intrinsic);
            let attributes = ScopeAttributes {
                layout: intrinsic.and_then(|i| i.fragment_layout),
                leading_dimension: match stage.scope {
                    MemoryScope::Fragment(FragmentRole::Accumulator) => None,
                    _ => intrinsic.and_then(|i| i.leading_dimension),
                },
            };
            let elements = stage.region().iter().product();
            let realization = self.recipe.memory_scope_realize(stage.dtype, stage.scope, elements, &attributes)?;
            decls.push(FragmentDecl { stage: stage.name.clone(), realization });
        }
        Ok(decls)
    }

    /// Runs the full synthesis; no partial schedule escapes on error.
    pub fn synthesize(&self, op: &Conv2dOp) -> Result<LoweringInput> {
        self.check_recipe(op)?;
        let shape_key = op.shape_key()?.to_string();
        let planner = TilePlanner::new(self.target.clone(), op.dtype);
        let plan = planner.plan(ProblemExtents::of(op), &self.config)?;
        let tensors = op.build_nchw()?;
        let mut sch = Schedule::create(&[&tensors.output])?;
        debug!("[Schedule] {} with {} via {}", op.name, shape_key, self.recipe.name());

        let output = sch.stage_of(&tensors.output)?;
        let padded = sch.stage_of(&tensors.padded)?;
        let filter = sch.stage_of(&tensors.filter)?;
        sch.compute_inline(padded)?;

        let image = {
            let shared = sch.cache_read(padded, MemoryScope::Shared, &[output])?;
            let fragment = sch.cache_read(shared, MemoryScope::Fragment(FragmentRole::OperandA), &[output])?;
            Staged { shared, fragment }
        };
        let weight = {
            let shared = sch.cache_read(filter, MemoryScope::Shared, &[output])?;
            let fragment = sch.cache_read(shared, MemoryScope::Fragment(FragmentRole::OperandB), &[output])?;
            Staged { shared, fragment }
        };
        let acc = sch.cache_write(output, MemoryScope::Fragment(FragmentRole::Accumulator))?;
        // The fragment store converts to the output dtype.
        let local = sch.cache_read_as(acc, MemoryScope::Local, op.out_dtype, &[output])?;

        // Output: (pq, no, ko, nv, kv, nt, kt, ni, ki)
        let (n, k) = (sch.axis(output, 0)?, sch.axis(output, 1)?);
        let (p, q) = (sch.axis(output, 2)?, sch.axis(output, 3)?);
        let bn = Self::tile_loop(&mut sch, output, n, &plan.batch)?;
        let bk = Self::tile_loop(&mut sch, output, k, &plan.out_channels)?;
        let pq = sch.fuse(output, p, q)?;
        sch.reorder(
            output,
            &[pq, bn.outer, bk.outer, bn.vector, bk.vector, bn.thread, bk.thread, bn.tile, bk.tile],
        )?;
        sch.bind(output, pq, ThreadAxis::BlockX)?;
        sch.bind(output, bn.outer, ThreadAxis::BlockZ)?;
        sch.bind(output, bk.outer, ThreadAxis::BlockY)?;
        if self.config.bind_virtual_threads {
            sch.bind(output, bn.vector, ThreadAxis::VThread)?;
            sch.bind(output, bk.vector, ThreadAxis::VThread)?;
        }
        sch.bind(output, bn.thread, ThreadAxis::ThreadZ)?;
        sch.bind(output, bk.thread, ThreadAxis::ThreadY)?;

        // The local copy reads the accumulator, so it must be in place first.
        sch.compute_at(local, output, bk.thread)?;
        sch.compute_at(acc, output, bk.thread)?;

        // Accumulator: (rco, rr, rs, rcv, n, k, rci)
        let rc = sch.loop_by_name(acc, "rc")?;
        let (rr, rs) = (sch.loop_by_name(acc, "rr")?, sch.loop_by_name(acc, "rs")?);
        let (rco, rest) = sch.split(acc, rc, plan.in_channels.outer)?;
        let (rcv, rci) = sch.split(acc, rest, plan.in_channels.vector)?;
        let (an, ak) = (sch.axis(acc, 0)?, sch.axis(acc, 1)?);
        sch.reorder(acc, &[rco, rr, rs, rcv, an, ak, rci])?;

        for staged in [&image, &weight] {
            sch.compute_at(staged.fragment, acc, rcv)?;
        }
        for staged in [&image, &weight] {
            sch.compute_at(staged.shared, acc, rs)?;
            self.cooperative_fetch(&mut sch, staged.shared, &plan)?;
        }

        for (staged, key) in [(&image, "load_a"), (&weight, "load_b")] {
            let ldm = Self::row_stride(&sch, staged.shared);
            let intrinsic = self.recipe.intrinsic(&shape_key, key, &self.options(Some(ldm)))?;
            let at = sch.axis(staged.fragment, 0)?;
            sch.tensorize(staged.fragment, at, intrinsic)?;
        }
        let mma = self.recipe.intrinsic(&shape_key, self.recipe.anchor().key(), &self.options(None))?;
        sch.tensorize(acc, an, mma)?;
        let ldm = Self::row_stride(&sch, local);
        let store = self.recipe.intrinsic(&shape_key, "store", &self.options(Some(ldm)))?;
        let at = sch.axis(local, 0)?;
        sch.tensorize(local, at, store)?;

        for staged in [&image, &weight] {
            sch.insert_barrier(staged.shared, staged.fragment)?;
        }
        let launch = validate(&sch, &self.target)?;
        let fragments = self.fragments(&sch)?;

        info!(
            "[Schedule] {}: {} stages, grid {:?}, block {:?}, {} shared bytes/step",
            op.name,
            sch.stages().len(),
            launch.grid,
            launch.block,
            plan.shared_bytes
        );
        Ok(LoweringInput {
            schedule: sch,
            boundary: tensors.args().iter().map(|t| t.desc()).collect(),
            launch,
            fragments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dtype::DType;
    use crate::recipe::TenetConvRecipe;

    #[test]
    fn test_reference_launch() {
        let recipe = TenetConvRecipe::new(DType::Float16, DType::Float32).unwrap();
        let synth = ScheduleSynthesizer::new(&recipe, HardwareTarget::volta(), SynthesisConfig::default());
        let lowered = synth.synthesize(&Conv2dOp::reference_workload()).unwrap();
        assert_eq!(lowered.launch.grid, [196, 4, 4]);
        assert_eq!(lowered.launch.block, [2, 4, 2]);
        let names: Vec<&str> = lowered.boundary.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Src", "Filter", "Output"]);
    }

    #[test]
    fn test_half_output_stages_match_store() {
        let recipe = TenetConvRecipe::fp16_fp16().unwrap();
        let synth = ScheduleSynthesizer::new(&recipe, HardwareTarget::volta(), SynthesisConfig::default());
        let op = Conv2dOp::reference_workload().with_dtypes(DType::Float16, DType::Float16);
        let lowered = synth.synthesize(&op).unwrap();
        let sch = &lowered.schedule;
        let acc = sch.stage(sch.stage_by_name("Output.wmma.accumulator").unwrap());
        let local = sch.stage(sch.stage_by_name("Output.wmma.accumulator.local").unwrap());
        assert_eq!(acc.dtype, DType::Float32);
        assert_eq!(local.dtype, DType::Float16);
        let store = &local.tensorized.as_ref().unwrap().intrinsic;
        assert_eq!(store.outputs[0].dtype, local.dtype);
        assert_eq!(store.inputs[0].dtype, acc.dtype);
    }

    #[test]
    fn test_dtype_mismatch() {
        let recipe = TenetConvRecipe::fp16_fp16().unwrap();
        let synth = ScheduleSynthesizer::new(&recipe, HardwareTarget::volta(), SynthesisConfig::default());
        let err = synth.synthesize(&Conv2dOp::reference_workload()).unwrap_err();
        assert!(matches!(err, TensorizeError::UnsupportedDtype(_)));
    }
}
