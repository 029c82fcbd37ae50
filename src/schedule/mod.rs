//! # Schedule IR
//!
//! A schedule is a set of stages, one per tensor that materialises a buffer,
//! plus the directive log that produced them. Stages own their loop nests as
//! an arena: root loops come first, split and fused loops are appended, and
//! `leaves` lists the loops that actually appear in the nest, outermost first.
//!
//! - **[`bound`]:** region inference for `compute_at`.
//! - **[`validate`]:** whole-schedule checks run before freezing.
//! - **[`synth`]:** the tensor-core schedule for direct convolution.

pub mod bound;
pub mod synth;
pub mod validate;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::capsule::{Intrinsic, IntrinsicOp};
use crate::core::dtype::DType;
use crate::error::{Result, TensorizeError};
use crate::recipe::ScopeRealization;
use crate::semantic::fragment::MemoryScope;
use crate::semantic::transition::{PhaseTransition, SyncRequirement};
use crate::te::{Affine, Expr, IterKind, IterVar, Tensor, TensorDesc};

pub use synth::ScheduleSynthesizer;
pub use validate::LaunchDims;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(pub usize);

/// Index into one stage's loop arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoopId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadAxis {
    BlockX,
    BlockY,
    BlockZ,
    VThread,
    ThreadX,
    ThreadY,
    ThreadZ,
}

impl ThreadAxis {
    pub fn name(self) -> &'static str {
        match self {
            Self::BlockX => "blockIdx.x",
            Self::BlockY => "blockIdx.y",
            Self::BlockZ => "blockIdx.z",
            Self::VThread => "vthread",
            Self::ThreadX => "threadIdx.x",
            Self::ThreadY => "threadIdx.y",
            Self::ThreadZ => "threadIdx.z",
        }
    }

    pub fn is_block(self) -> bool {
        matches!(self, Self::BlockX | Self::BlockY | Self::BlockZ)
    }

    /// Anything executed inside a block: real or virtual threads.
    pub fn is_thread(self) -> bool {
        !self.is_block()
    }
}

impl fmt::Display for ThreadAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopOrigin {
    /// The i-th root axis of the stage.
    Root(usize),
    SplitOuter(LoopId),
    SplitInner(LoopId),
    /// Outer and inner loop of a fuse.
    Fused(LoopId, LoopId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loop {
    pub name: String,
    pub extent: usize,
    pub kind: IterKind,
    pub origin: LoopOrigin,
    pub binding: Option<ThreadAxis>,
}

/// One read of another stage; indices are affine over the reader's root axes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    pub tensor: StageId,
    pub indices: Vec<Affine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attach {
    /// Own loop nest at kernel level.
    Root,
    /// Substituted into its consumers.
    Inline,
    At { stage: StageId, loop_id: LoopId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageKind {
    Placeholder,
    Compute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tensorization {
    pub loop_id: LoopId,
    pub intrinsic: Intrinsic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub kind: StageKind,
    pub scope: MemoryScope,
    pub dtype: DType,
    /// Type the body accumulates in before its final cast.
    pub accumulate: DType,
    pub shape: Vec<usize>,
    /// Data axes first, then reduction axes. Data extents shrink to the
    /// inferred region once the stage is attached.
    pub roots: Vec<IterVar>,
    pub loops: Vec<Loop>,
    pub leaves: Vec<LoopId>,
    pub reads: Vec<Access>,
    pub attach: Attach,
    pub tensorized: Option<Tensorization>,
}

impl Stage {
    fn new(name: &str, kind: StageKind, scope: MemoryScope, dtype: DType, shape: Vec<usize>, roots: Vec<IterVar>) -> Self {
        let mut stage = Self {
            name: name.to_string(),
            kind,
            scope,
            dtype,
            accumulate: dtype,
            shape,
            roots,
            loops: Vec::new(),
            leaves: Vec::new(),
            reads: Vec::new(),
            attach: Attach::Root,
            tensorized: None,
        };
        stage.reset_loops();
        stage
    }

    fn reset_loops(&mut self) {
        self.loops = self
            .roots
            .iter()
            .enumerate()
            .map(|(i, root)| Loop {
                name: root.name.clone(),
                extent: root.extent,
                kind: root.kind,
                origin: LoopOrigin::Root(i),
                binding: None,
            })
            .collect();
        self.leaves = (0..self.loops.len()).map(LoopId).collect();
    }

    pub fn get_loop(&self, id: LoopId) -> &Loop {
        &self.loops[id.0]
    }

    pub fn data_axes(&self) -> impl Iterator<Item = &IterVar> {
        self.roots.iter().filter(|r| r.kind == IterKind::Data)
    }

    pub fn num_data_axes(&self) -> usize {
        self.data_axes().count()
    }

    /// Extents of the buffer this stage materialises.
    pub fn region(&self) -> Vec<usize> {
        self.data_axes().map(|r| r.extent).collect()
    }

    pub fn position(&self, id: LoopId) -> Option<usize> {
        self.leaves.iter().position(|&l| l == id)
    }

    /// Root axes a loop iterates over.
    pub fn roots_of(&self, id: LoopId) -> Vec<usize> {
        match self.loops[id.0].origin {
            LoopOrigin::Root(i) => vec![i],
            LoopOrigin::SplitOuter(parent) | LoopOrigin::SplitInner(parent) => self.roots_of(parent),
            LoopOrigin::Fused(outer, inner) => {
                let mut roots = self.roots_of(outer);
                roots.extend(self.roots_of(inner));
                roots
            }
        }
    }

    pub fn is_transformed(&self) -> bool {
        self.loops.len() != self.roots.len()
            || self.leaves.iter().enumerate().any(|(i, l)| l.0 != i)
            || self.loops.iter().any(|l| l.binding.is_some())
    }

    pub fn reads_from(&self, producer: StageId) -> bool {
        self.reads.iter().any(|a| a.tensor == producer)
    }

    pub fn desc(&self) -> TensorDesc {
        TensorDesc { name: self.name.clone(), shape: self.shape.clone(), dtype: self.dtype }
    }
}

/// One schedule primitive as applied, in application order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Directive {
    ComputeInline { stage: String },
    CacheRead { source: String, scope: MemoryScope, dtype: DType, readers: Vec<String>, stage: String },
    CacheWrite { source: String, scope: MemoryScope, stage: String },
    Split { stage: String, loop_name: String, nparts: usize, outer: String, inner: String },
    Fuse { stage: String, outer: String, inner: String, fused: String },
    Reorder { stage: String, order: Vec<String> },
    Bind { stage: String, loop_name: String, axis: ThreadAxis },
    ComputeAt { stage: String, target: String, loop_name: String, region: Vec<usize> },
    Tensorize { stage: String, loop_name: String, op: IntrinsicOp },
    Barrier { producer: String, consumer: String },
}

/// Synchronisation the backend must emit before `consumer` runs at its
/// attach point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPoint {
    pub producer: String,
    pub consumer: String,
    /// Stage and loop whose body the consumer is computed in.
    pub stage: Option<String>,
    pub loop_name: Option<String>,
    pub requirement: SyncRequirement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    stages: Vec<Stage>,
    outputs: Vec<StageId>,
    directives: Vec<Directive>,
    sync_points: Vec<SyncPoint>,
}

fn invalid(msg: String) -> TensorizeError {
    TensorizeError::InvalidSchedule(msg)
}

impl Schedule {
    /// One stage per tensor reachable from `outputs`, producers first.
    pub fn create(outputs: &[&Tensor]) -> Result<Self> {
        let mut schedule = Self {
            stages: Vec::new(),
            outputs: Vec::new(),
            directives: Vec::new(),
            sync_points: Vec::new(),
        };
        let mut seen: HashMap<usize, StageId> = HashMap::new();
        for output in outputs {
            let id = schedule.add_tensor(output, &mut seen)?;
            schedule.outputs.push(id);
        }
        Ok(schedule)
    }

    fn add_tensor(&mut self, tensor: &Tensor, seen: &mut HashMap<usize, StageId>) -> Result<StageId> {
        if let Some(&id) = seen.get(&tensor.node_id()) {
            return Ok(id);
        }
        if self.stages.iter().any(|s| s.name == tensor.name()) {
            return Err(invalid(format!("two distinct tensors are named `{}`", tensor.name())));
        }
        for input in tensor.input_tensors() {
            self.add_tensor(&input, seen)?;
        }

        let stage = match tensor.body() {
            None => Stage::new(
                tensor.name(),
                StageKind::Placeholder,
                MemoryScope::Global,
                tensor.dtype(),
                tensor.shape().to_vec(),
                Vec::new(),
            ),
            Some(body) => {
                let mut roots = tensor.axes().to_vec();
                roots.extend(tensor.reduce_axes().iter().cloned());
                let mut stage = Stage::new(
                    tensor.name(),
                    StageKind::Compute,
                    MemoryScope::Global,
                    tensor.dtype(),
                    tensor.shape().to_vec(),
                    roots,
                );
                if let Expr::Cast(_, inner) = body {
                    if matches!(**inner, Expr::Sum(..)) {
                        stage.accumulate = inner.dtype();
                    }
                }
                for (input, indices) in body.loads() {
                    let producer = seen[&input.node_id()];
                    let indices = indices
                        .iter()
                        .map(|e| e.affine())
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| invalid(format!("`{}` reads `{}` at a non-affine index", tensor.name(), input.name())))?;
                    stage.reads.push(Access { tensor: producer, indices });
                }
                stage
            }
        };
        let id = StageId(self.stages.len());
        self.stages.push(stage);
        seen.insert(tensor.node_id(), id);
        Ok(id)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, id: StageId) -> &Stage {
        &self.stages[id.0]
    }

    pub fn outputs(&self) -> &[StageId] {
        &self.outputs
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    pub fn sync_points(&self) -> &[SyncPoint] {
        &self.sync_points
    }

    pub fn stage_by_name(&self, name: &str) -> Result<StageId> {
        self.stages
            .iter()
            .position(|s| s.name == name)
            .map(StageId)
            .ok_or_else(|| invalid(format!("no stage named `{}`", name)))
    }

    pub fn stage_of(&self, tensor: &Tensor) -> Result<StageId> {
        self.stage_by_name(tensor.name())
    }

    /// Root loop of the i-th data axis.
    pub fn axis(&self, stage: StageId, i: usize) -> Result<LoopId> {
        let s = self.stage(stage);
        if i >= s.num_data_axes() {
            return Err(invalid(format!("`{}` has no data axis {}", s.name, i)));
        }
        Ok(LoopId(i))
    }

    /// Root loop of the i-th reduction axis.
    pub fn reduce_axis(&self, stage: StageId, i: usize) -> Result<LoopId> {
        let s = self.stage(stage);
        let data = s.num_data_axes();
        if data + i >= s.roots.len() {
            return Err(invalid(format!("`{}` has no reduction axis {}", s.name, i)));
        }
        Ok(LoopId(data + i))
    }

    pub fn loop_by_name(&self, stage: StageId, name: &str) -> Result<LoopId> {
        let s = self.stage(stage);
        s.loops
            .iter()
            .position(|l| l.name == name)
            .map(LoopId)
            .ok_or_else(|| invalid(format!("`{}` has no loop `{}`", s.name, name)))
    }

    pub fn leaves(&self, stage: StageId) -> &[LoopId] {
        &self.stage(stage).leaves
    }

    /// Stages computed inside a loop of `target`.
    pub fn attached_to(&self, target: StageId) -> impl Iterator<Item = StageId> + '_ {
        self.stages.iter().enumerate().filter_map(move |(i, s)| match s.attach {
            Attach::At { stage, .. } if stage == target => Some(StageId(i)),
            _ => None,
        })
    }

    /// Stages that read `producer`.
    pub fn consumers(&self, producer: StageId) -> Vec<StageId> {
        (0..self.stages.len())
            .map(StageId)
            .filter(|&id| self.stage(id).reads_from(producer))
            .collect()
    }

    fn compute_stage(&self, stage: StageId) -> Result<&Stage> {
        let s = self.stages.get(stage.0).ok_or_else(|| invalid(format!("no stage {}", stage.0)))?;
        if s.kind == StageKind::Placeholder {
            return Err(invalid(format!("`{}` is a placeholder and has no loops", s.name)));
        }
        Ok(s)
    }

    fn leaf_position(&self, stage: StageId, id: LoopId) -> Result<usize> {
        let s = self.compute_stage(stage)?;
        s.position(id).ok_or_else(|| {
            let name = s.loops.get(id.0).map_or("?", |l| l.name.as_str());
            invalid(format!("loop `{}` is not a leaf of `{}`", name, s.name))
        })
    }

    /// Loop structure of `stage` is frozen once other stages hang off it.
    fn ensure_no_attached(&self, stage: StageId) -> Result<()> {
        if let Some(child) = self.attached_to(stage).next() {
            return Err(invalid(format!(
                "`{}` is attached inside `{}`; transform loops before attaching",
                self.stage(child).name,
                self.stage(stage).name
            )));
        }
        Ok(())
    }

    fn redirect(&mut self, readers: &[StageId], from: StageId, to: StageId) {
        for &reader in readers {
            for access in &mut self.stages[reader.0].reads {
                if access.tensor == from {
                    access.tensor = to;
                }
            }
        }
    }

    fn push_stage(&mut self, stage: Stage) -> StageId {
        let id = StageId(self.stages.len());
        self.stages.push(stage);
        id
    }

    pub fn compute_inline(&mut self, stage: StageId) -> Result<()> {
        let s = self.compute_stage(stage)?;
        if s.roots.iter().any(|r| r.kind == IterKind::Reduce) {
            return Err(invalid(format!("`{}` reduces and cannot be inlined", s.name)));
        }
        if self.outputs.contains(&stage) {
            return Err(invalid(format!("output `{}` cannot be inlined", s.name)));
        }
        let name = s.name.clone();
        self.stages[stage.0].attach = Attach::Inline;
        self.directives.push(Directive::ComputeInline { stage: name });
        Ok(())
    }

    /// Stages `source` through a new buffer in `scope`, read by `readers`.
    pub fn cache_read(&mut self, source: StageId, scope: MemoryScope, readers: &[StageId]) -> Result<StageId> {
        let dtype = self.stage(source).dtype;
        self.cache_read_as(source, scope, dtype, readers)
    }

    /// Like [`Schedule::cache_read`], but the new buffer holds `dtype` and the
    /// copy converts on the way in.
    pub fn cache_read_as(
        &mut self,
        source: StageId,
        scope: MemoryScope,
        dtype: DType,
        readers: &[StageId],
    ) -> Result<StageId> {
        let src = self.stage(source);
        if readers.is_empty() {
            return Err(invalid(format!("cache_read of `{}` needs at least one reader", src.name)));
        }
        for &reader in readers {
            if !self.stage(reader).reads_from(source) {
                return Err(invalid(format!("`{}` does not read `{}`", self.stage(reader).name, src.name)));
            }
        }

        let roots: Vec<IterVar> = match src.kind {
            StageKind::Compute => src.data_axes().cloned().collect(),
            StageKind::Placeholder => src
                .shape
                .iter()
                .enumerate()
                .map(|(i, &extent)| IterVar::data(&format!("ax{}", i), extent))
                .collect(),
        };
        let indices = roots.iter().map(|r| Affine::var(&r.name)).collect();
        let name = format!("{}.{}", src.name, scope);
        let mut stage = Stage::new(&name, StageKind::Compute, scope, dtype, src.shape.clone(), roots);
        stage.reads.push(Access { tensor: source, indices });

        let directive = Directive::CacheRead {
            source: src.name.clone(),
            scope,
            dtype,
            readers: readers.iter().map(|&r| self.stage(r).name.clone()).collect(),
            stage: name,
        };
        let id = self.push_stage(stage);
        self.redirect(readers, source, id);
        self.directives.push(directive);
        Ok(id)
    }

    /// Computes `target` into a new `scope` buffer; `target` becomes a copy of it.
    pub fn cache_write(&mut self, target: StageId, scope: MemoryScope) -> Result<StageId> {
        let t = self.compute_stage(target)?;
        if t.is_transformed() || t.attach != Attach::Root {
            return Err(invalid(format!("cache_write of `{}` must precede its other directives", t.name)));
        }
        let name = format!("{}.{}", t.name, scope);
        let mut stage = Stage::new(&name, StageKind::Compute, scope, t.accumulate, t.shape.clone(), t.roots.clone());
        stage.reads = t.reads.clone();
        let data: Vec<IterVar> = t.data_axes().cloned().collect();
        let indices = data.iter().map(|r| Affine::var(&r.name)).collect();
        let directive = Directive::CacheWrite { source: t.name.clone(), scope, stage: name };

        let id = self.push_stage(stage);
        let t = &mut self.stages[target.0];
        t.roots = data;
        t.reset_loops();
        t.reads = vec![Access { tensor: id, indices }];
        self.directives.push(directive);
        Ok(id)
    }

    /// Splits a leaf into `nparts` outer iterations.
    pub fn split(&mut self, stage: StageId, id: LoopId, nparts: usize) -> Result<(LoopId, LoopId)> {
        let pos = self.leaf_position(stage, id)?;
        self.ensure_no_attached(stage)?;
        let s = self.stage(stage);
        let lp = s.get_loop(id);
        if matches!(lp.origin, LoopOrigin::Fused(..)) {
            return Err(invalid(format!("fused loop `{}` of `{}` cannot be split", lp.name, s.name)));
        }
        if lp.binding.is_some() {
            return Err(invalid(format!("bound loop `{}` of `{}` cannot be split", lp.name, s.name)));
        }
        if nparts == 0 || lp.extent % nparts != 0 {
            return Err(TensorizeError::IndivisibleSplit {
                stage: s.name.clone(),
                loop_name: lp.name.clone(),
                extent: lp.extent,
                nparts,
            });
        }

        let outer = Loop {
            name: format!("{}.outer", lp.name),
            extent: nparts,
            kind: lp.kind,
            origin: LoopOrigin::SplitOuter(id),
            binding: None,
        };
        let inner = Loop {
            name: format!("{}.inner", lp.name),
            extent: lp.extent / nparts,
            kind: lp.kind,
            origin: LoopOrigin::SplitInner(id),
            binding: None,
        };
        let directive = Directive::Split {
            stage: s.name.clone(),
            loop_name: lp.name.clone(),
            nparts,
            outer: outer.name.clone(),
            inner: inner.name.clone(),
        };

        let s = &mut self.stages[stage.0];
        let (o, i) = (LoopId(s.loops.len()), LoopId(s.loops.len() + 1));
        s.loops.push(outer);
        s.loops.push(inner);
        s.leaves.splice(pos..=pos, [o, i]);
        trace!("[Schedule] {:?}", directive);
        self.directives.push(directive);
        Ok((o, i))
    }

    /// Fuses two adjacent data leaves into one.
    pub fn fuse(&mut self, stage: StageId, outer: LoopId, inner: LoopId) -> Result<LoopId> {
        let po = self.leaf_position(stage, outer)?;
        let pi = self.leaf_position(stage, inner)?;
        self.ensure_no_attached(stage)?;
        let s = self.stage(stage);
        let (lo, li) = (s.get_loop(outer), s.get_loop(inner));
        if pi != po + 1 {
            return Err(invalid(format!("`{}` and `{}` of `{}` are not adjacent", lo.name, li.name, s.name)));
        }
        if lo.kind != IterKind::Data || li.kind != IterKind::Data {
            return Err(invalid(format!("only data loops of `{}` can be fused", s.name)));
        }
        let fused = Loop {
            name: format!("{}.{}.fused", lo.name, li.name),
            extent: lo.extent * li.extent,
            kind: IterKind::Data,
            origin: LoopOrigin::Fused(outer, inner),
            binding: None,
        };
        let directive = Directive::Fuse {
            stage: s.name.clone(),
            outer: lo.name.clone(),
            inner: li.name.clone(),
            fused: fused.name.clone(),
        };

        let s = &mut self.stages[stage.0];
        let id = LoopId(s.loops.len());
        s.loops.push(fused);
        s.leaves.splice(po..=pi, [id]);
        self.directives.push(directive);
        Ok(id)
    }

    /// Places the given leaves in this order, within the slots they occupy.
    pub fn reorder(&mut self, stage: StageId, order: &[LoopId]) -> Result<()> {
        let mut slots = Vec::with_capacity(order.len());
        for &id in order {
            slots.push(self.leaf_position(stage, id)?);
        }
        self.ensure_no_attached(stage)?;
        let mut sorted = slots.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != slots.len() {
            return Err(invalid(format!("reorder of `{}` names a loop twice", self.stage(stage).name)));
        }
        let s = &mut self.stages[stage.0];
        for (&slot, &id) in sorted.iter().zip(order) {
            s.leaves[slot] = id;
        }
        let directive = Directive::Reorder {
            stage: s.name.clone(),
            order: order.iter().map(|&id| s.loops[id.0].name.clone()).collect(),
        };
        self.directives.push(directive);
        Ok(())
    }

    pub fn bind(&mut self, stage: StageId, id: LoopId, axis: ThreadAxis) -> Result<()> {
        self.leaf_position(stage, id)?;
        let s = self.stage(stage);
        let lp = s.get_loop(id);
        if lp.kind == IterKind::Reduce {
            return Err(invalid(format!("reduction loop `{}` of `{}` cannot be bound to {}", lp.name, s.name, axis)));
        }
        if let Some(existing) = lp.binding {
            return Err(invalid(format!("`{}` of `{}` is already bound to {}", lp.name, s.name, existing)));
        }
        if axis != ThreadAxis::VThread {
            if let Some(other) = s.loops.iter().find(|l| l.binding == Some(axis)) {
                return Err(invalid(format!(
                    "{} is bound twice in `{}` (`{}` and `{}`)",
                    axis, s.name, other.name, lp.name
                )));
            }
        }
        let directive = Directive::Bind { stage: s.name.clone(), loop_name: lp.name.clone(), axis };
        self.stages[stage.0].loops[id.0].binding = Some(axis);
        self.directives.push(directive);
        Ok(())
    }

    /// Computes `stage` inside loop `at` of `target`, shrinking its buffer to
    /// the region one iteration of `at` needs.
    pub fn compute_at(&mut self, stage: StageId, target: StageId, at: LoopId) -> Result<()> {
        self.leaf_position(target, at)?;
        let s = self.compute_stage(stage)?;
        if stage == target || s.attach == Attach::Inline {
            return Err(invalid(format!("`{}` cannot be attached to `{}`", s.name, self.stage(target).name)));
        }
        if s.is_transformed() {
            return Err(invalid(format!("`{}` must be attached before its loops are transformed", s.name)));
        }

        let region = bound::infer_region(self, stage, target, at)?;
        let directive = Directive::ComputeAt {
            stage: s.name.clone(),
            target: self.stage(target).name.clone(),
            loop_name: self.stage(target).get_loop(at).name.clone(),
            region: region.clone(),
        };

        let s = &mut self.stages[stage.0];
        for (root, extent) in s.roots.iter_mut().filter(|r| r.kind == IterKind::Data).zip(&region) {
            root.extent = *extent;
        }
        s.reset_loops();
        s.attach = Attach::At { stage: target, loop_id: at };
        trace!("[Schedule] {:?}", directive);
        self.directives.push(directive);
        Ok(())
    }

    /// Replaces the nest rooted at leaf `at` with `intrinsic`.
    pub fn tensorize(&mut self, stage: StageId, at: LoopId, intrinsic: Intrinsic) -> Result<()> {
        let pos = self.leaf_position(stage, at)?;
        let s = self.stage(stage);
        let nest: Vec<&Loop> = s.leaves[pos..].iter().map(|&l| s.get_loop(l)).collect();
        if let Some(bound) = nest.iter().find(|l| l.binding.is_some()) {
            return Err(invalid(format!("tensorized nest of `{}` contains bound loop `{}`", s.name, bound.name)));
        }
        let extents: Vec<usize> = nest.iter().map(|l| l.extent).filter(|&e| e != 1).collect();
        if extents != intrinsic.nest {
            return Err(TensorizeError::ShapeMismatch {
                context: format!("tensorize `{}` at `{}` with {}", s.name, s.get_loop(at).name, intrinsic.name()),
                expected: format!("{:?}", intrinsic.nest),
                actual: format!("{:?}", extents),
            });
        }
        self.check_bindings(stage, &intrinsic)?;
        let directive = Directive::Tensorize {
            stage: s.name.clone(),
            loop_name: s.get_loop(at).name.clone(),
            op: intrinsic.op,
        };
        self.stages[stage.0].tensorized = Some(Tensorization { loop_id: at, intrinsic });
        self.directives.push(directive);
        Ok(())
    }

    /// The intrinsic must write this stage's buffer and read buffers the
    /// stage actually reads, with matching scope and dtype.
    fn check_bindings(&self, stage: StageId, intrinsic: &Intrinsic) -> Result<()> {
        let s = self.stage(stage);
        let mismatch = |binding: &str, expected: String, actual: String| TensorizeError::UnsupportedDtype(format!(
            "{} on `{}`: {} binding is {} but the buffer is {}",
            intrinsic.name(),
            s.name,
            binding,
            expected,
            actual
        ));
        for out in &intrinsic.outputs {
            if out.scope != s.scope || out.dtype != s.dtype {
                return Err(mismatch(
                    "output",
                    format!("{} {}", out.scope, out.dtype),
                    format!("{} {}", s.scope, s.dtype),
                ));
            }
        }
        for input in &intrinsic.inputs {
            let producers: Vec<&Stage> = s.reads.iter().map(|a| self.stage(a.tensor)).collect();
            if !producers.iter().any(|p| p.scope == input.scope && p.dtype == input.dtype) {
                let read = producers
                    .iter()
                    .map(|p| format!("{} {}", p.scope, p.dtype))
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(mismatch("input", format!("{} {}", input.scope, input.dtype), format!("[{}]", read)));
            }
        }
        Ok(())
    }

    /// Orders every write of `producer` before any read of it by `consumer`.
    pub fn insert_barrier(&mut self, producer: StageId, consumer: StageId) -> Result<()> {
        let (p, c) = (self.stage(producer), self.stage(consumer));
        let (p_name, c_name) = (p.name.clone(), c.name.clone());
        if !c.reads_from(producer) {
            return Err(invalid(format!("`{}` does not read `{}`", c_name, p_name)));
        }
        let requirement = PhaseTransition::new(p.scope, c.scope).required_sync();
        if requirement == SyncRequirement::None {
            return Err(invalid(format!("{} -> {} needs no barrier ({} to {})", p_name, c_name, p.scope, c.scope)));
        }
        let (stage, loop_name) = match c.attach {
            Attach::At { stage, loop_id } => {
                let t = self.stage(stage);
                (Some(t.name.clone()), Some(t.get_loop(loop_id).name.clone()))
            }
            _ => (None, None),
        };
        self.sync_points.push(SyncPoint {
            producer: p_name.clone(),
            consumer: c_name.clone(),
            stage,
            loop_name,
            requirement,
        });
        self.directives.push(Directive::Barrier { producer: p_name, consumer: c_name });
        Ok(())
    }

    pub fn has_barrier(&self, producer: StageId, consumer: StageId) -> bool {
        let (p, c) = (&self.stage(producer).name, &self.stage(consumer).name);
        self.sync_points
            .iter()
            .any(|sp| &sp.producer == p && &sp.consumer == c && sp.requirement == SyncRequirement::Barrier)
    }
}

/// Backend declaration of one fragment-scoped stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentDecl {
    pub stage: String,
    pub realization: ScopeRealization,
}

/// Frozen schedule plus the tensors the backend binds as kernel arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoweringInput {
    pub schedule: Schedule,
    /// Input and output tensors, in argument order.
    pub boundary: Vec<TensorDesc>,
    pub launch: LaunchDims,
    pub fragments: Vec<FragmentDecl>,
}

impl LoweringInput {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
