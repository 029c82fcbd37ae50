use std::collections::BTreeMap;

use tracing::debug;

use crate::capsule::{Capsule, CapsuleIo, CapsuleKind, ConvLayout, Intrinsic};
use crate::core::device::{HardwareTarget, TileShape};
use crate::core::dtype::DType;
use crate::core::shape::ShapeKey;
use crate::error::{Result, TensorizeError};
use crate::recipe::dag::{self, ComputeDag, NodeKind};
use crate::recipe::{CompilationRecipe, EdgeMap, IntrinsicOptions, ScopeAttributes, ScopeRealization};
use crate::semantic::fragment::{Fragment, FragmentLayout, FragmentRole, MemoryScope};
use crate::te::{placeholder, Tensor};

pub const FAMILY: &str = "tenet conv";

/// Raw operator inputs of the read graph.
const LEAVES: [&str; 2] = ["a", "b"];

/// Conv2d decomposed as `store(mma(load_a(a), load_b(b)))`, anchored at `mma`.
#[derive(Debug, Clone)]
pub struct TenetConvRecipe {
    name: String,
    capsules: BTreeMap<String, Capsule>,
    edges: EdgeMap,
    anchor: CapsuleKind,
    input_dtypes: BTreeMap<String, Vec<DType>>,
    output_dtypes: BTreeMap<String, Vec<DType>>,
    target: HardwareTarget,
}

fn short_name(dtype: DType) -> &'static str {
    match dtype {
        DType::Float16 => "fp16",
        DType::BFloat16 => "bf16",
        DType::Float32 => "fp32",
        DType::Float64 => "fp64",
        DType::Int4 => "int4",
        DType::Int8 => "int8",
        DType::Int32 => "int32",
        DType::Bool => "bool",
    }
}

/// Matrix-unit shape the device offers for an operand type.
fn native_tile(operand: DType) -> TileShape {
    match operand {
        DType::Int4 => TileShape::new(8, 8, 32),
        DType::Bool => TileShape::new(8, 8, 128),
        _ => TileShape::new(16, 16, 16),
    }
}

pub fn standard_edges() -> EdgeMap {
    let mut edges = EdgeMap::new();
    edges.insert("load_a".into(), vec!["a".into()]);
    edges.insert("load_b".into(), vec!["b".into()]);
    edges.insert("mma".into(), vec!["load_a".into(), "load_b".into()]);
    edges.insert("store".into(), vec!["mma".into()]);
    edges
}

impl TenetConvRecipe {
    /// Standard tables: operands stay in `operand` through the loads, `mma`
    /// accumulates in the promoted type and `store` casts to `output`.
    pub fn new(operand: DType, output: DType) -> Result<Self> {
        let acc = operand.accumulator();
        let table = |entries: [(&str, Vec<DType>); 6]| -> BTreeMap<String, Vec<DType>> {
            entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
        };
        let inputs = table([
            ("a", vec![operand]),
            ("b", vec![operand]),
            ("load_a", vec![operand]),
            ("load_b", vec![operand]),
            ("mma", vec![operand, operand]),
            ("store", vec![acc]),
        ]);
        let outputs = table([
            ("a", vec![operand]),
            ("b", vec![operand]),
            ("load_a", vec![operand]),
            ("load_b", vec![operand]),
            ("mma", vec![acc]),
            ("store", vec![output]),
        ]);
        let name = format!("tenet_conv_{}_{}", short_name(operand), short_name(output));
        let target = HardwareTarget::default().with_tile(native_tile(operand));
        Self::with_tables(&name, inputs, outputs, target)
    }

    pub fn fp16_fp16() -> Result<Self> {
        Self::new(DType::Float16, DType::Float16)
    }

    /// Builds a recipe from explicit dtype tables, checking that they agree
    /// along every edge and that `mma` never narrows.
    pub fn with_tables(
        name: &str,
        input_dtypes: BTreeMap<String, Vec<DType>>,
        output_dtypes: BTreeMap<String, Vec<DType>>,
        target: HardwareTarget,
    ) -> Result<Self> {
        let capsules: BTreeMap<String, Capsule> = CapsuleKind::ALL
            .iter()
            .map(|&kind| (kind.key().to_string(), Capsule::of_kind(kind)))
            .collect();
        let recipe = Self {
            name: name.to_string(),
            capsules,
            edges: standard_edges(),
            anchor: CapsuleKind::Mma,
            input_dtypes,
            output_dtypes,
            target,
        };
        recipe.check_tables()?;
        debug!(
            "[Recipe] {} ready: anchor={} acc={} target={}",
            recipe.name,
            recipe.anchor,
            recipe.output_dtypes[recipe.anchor.key()][0],
            recipe.target.name
        );
        Ok(recipe)
    }

    pub fn with_target(mut self, target: HardwareTarget) -> Self {
        self.target = target;
        self
    }

    fn check_tables(&self) -> Result<()> {
        for key in LEAVES.iter().copied().chain(self.capsules.keys().map(String::as_str)) {
            let fan_in = self.capsules.get(key).map_or(1, Capsule::fan_in);
            let ins = self.input_dtypes(key)?;
            let outs = self.output_dtypes(key)?;
            if ins.len() != fan_in || outs.len() != 1 {
                return Err(TensorizeError::InvalidGraph(format!(
                    "dtype table of `{}` has {} inputs and {} outputs, expected {} and 1",
                    key,
                    ins.len(),
                    outs.len(),
                    fan_in
                )));
            }
        }

        for (child, parents) in &self.edges {
            let ins = self.input_dtypes(child)?;
            for (slot, parent) in parents.iter().enumerate() {
                let produced = self.output_dtypes(parent)?[0];
                if produced != ins[slot] {
                    return Err(TensorizeError::InvalidGraph(format!(
                        "`{}` produces {} but `{}` reads input {} as {}",
                        parent, produced, child, slot, ins[slot]
                    )));
                }
            }
        }

        let anchor = self.anchor.key();
        let acc = self.output_dtypes(anchor)?[0];
        for &input in self.input_dtypes(anchor)? {
            input.check_accumulator(acc, anchor)?;
        }
        Ok(())
    }

    fn unknown(&self, key: &str) -> TensorizeError {
        TensorizeError::UnknownCapsule {
            recipe: self.name.clone(),
            capsule: key.to_string(),
        }
    }

    fn capsule(&self, key: &str) -> Result<&Capsule> {
        self.capsules.get(key).ok_or_else(|| self.unknown(key))
    }

    fn io(&self, key: &str, problem: &ShapeKey) -> Result<CapsuleIo> {
        let capsule = self.capsule(key)?;
        let (inputs, output) = match capsule.kind() {
            CapsuleKind::LoadA => (vec![problem.a_shape()], problem.a_shape()),
            CapsuleKind::LoadB => (vec![problem.b_shape()], problem.b_shape()),
            CapsuleKind::Mma => (vec![problem.a_shape(), problem.b_shape()], problem.c_shape()),
            CapsuleKind::Store => (vec![problem.c_shape()], problem.c_shape()),
        };
        Ok(CapsuleIo::new(
            inputs,
            vec![output],
            self.input_dtypes(key)?.to_vec(),
            self.output_dtypes(key)?.to_vec(),
        ))
    }

    fn leaf(&self, key: &str, problem: &ShapeKey) -> Result<Tensor> {
        let dtype = self.output_dtypes(key)?[0];
        match key {
            "a" => Ok(placeholder(&problem.a_shape(), dtype, "A")),
            "b" => Ok(placeholder(&problem.b_shape(), dtype, "B")),
            other => Err(self.unknown(other)),
        }
    }

    fn build_standalone(&self, key: &str, problem: &ShapeKey) -> Result<(Vec<Tensor>, Tensor)> {
        let io = self.io(key, problem)?;
        self.capsule(key)?.compute_expression(&io, problem)
    }
}

impl CompilationRecipe for TenetConvRecipe {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> &str {
        FAMILY
    }

    fn target(&self) -> &HardwareTarget {
        &self.target
    }

    fn anchor(&self) -> CapsuleKind {
        self.anchor
    }

    fn edges(&self) -> &EdgeMap {
        &self.edges
    }

    fn all_shape_keys(&self) -> Vec<String> {
        vec!["16x4x4x16x1x1".to_string()]
    }

    fn all_compute_keys(&self) -> Vec<String> {
        vec!["default".to_string()]
    }

    fn input_dtypes(&self, key: &str) -> Result<&[DType]> {
        self.input_dtypes.get(key).map(Vec::as_slice).ok_or_else(|| self.unknown(key))
    }

    fn output_dtypes(&self, key: &str) -> Result<&[DType]> {
        self.output_dtypes.get(key).map(Vec::as_slice).ok_or_else(|| self.unknown(key))
    }

    fn main_compute_expression(&self, shape_key: &str) -> Result<(Vec<Tensor>, Tensor)> {
        self.capsule_compute_expression(shape_key, self.anchor.key())
    }

    fn capsule_compute_expression(&self, shape_key: &str, capsule_key: &str) -> Result<(Vec<Tensor>, Tensor)> {
        let problem = self.problem_size(shape_key)?;
        self.build_standalone(capsule_key, &problem)
    }

    fn capsule_compute_expression_with_shape(
        &self,
        shape_key: &str,
        capsule_key: &str,
        input_shapes: &[Vec<usize>],
        output_shapes: &[Vec<usize>],
    ) -> Result<(Vec<Tensor>, Tensor)> {
        let problem = self.problem_size(shape_key)?;
        let capsule = self.capsule(capsule_key)?;
        if capsule.kind() == self.anchor {
            return Err(TensorizeError::InvalidGraph(format!(
                "anchor capsule `{}` of `{}` only exists at the problem shape",
                capsule_key, self.name
            )));
        }
        let io = CapsuleIo::new(
            input_shapes.to_vec(),
            output_shapes.to_vec(),
            self.input_dtypes(capsule_key)?.to_vec(),
            self.output_dtypes(capsule_key)?.to_vec(),
        );
        capsule.compute_expression(&io, &problem)
    }

    fn dag_compute_expression_with_inputs(
        &self,
        shape_key: &str,
        capsule_keys: &[&str],
        edges: &EdgeMap,
    ) -> Result<ComputeDag> {
        let problem = self.problem_size(shape_key)?;
        let plan = dag::plan(
            capsule_keys,
            edges,
            |key| LEAVES.contains(&key),
            |key| self.capsules.contains_key(key),
            |key| self.unknown(key),
        )?;

        let mut built: Vec<Option<Tensor>> = vec![None; plan.nodes.len()];
        let mut inputs = Vec::new();
        let mut cache = BTreeMap::new();
        for &id in &plan.order {
            let node = &plan.nodes[id];
            let tensor = match node.kind {
                NodeKind::Leaf => {
                    let leaf = self.leaf(&node.key, &problem)?;
                    inputs.push(leaf.clone());
                    leaf
                }
                NodeKind::Root => {
                    let (free, output) = self.build_standalone(&node.key, &problem)?;
                    inputs.extend(free);
                    output
                }
                NodeKind::Bound => {
                    let parents = node
                        .parents
                        .iter()
                        .map(|&p| {
                            built[p].clone().ok_or_else(|| {
                                TensorizeError::InvalidGraph(format!(
                                    "`{}` scheduled before its parent `{}`",
                                    node.key, plan.nodes[p].key
                                ))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    let io = self.io(&node.key, &problem)?;
                    let (_, output) = self.capsule(&node.key)?.compute_expression_with_inputs(&parents, &io, &problem)?;
                    output
                }
            };
            cache.insert(node.key.clone(), tensor.clone());
            built[id] = Some(tensor);
        }

        let outputs = plan
            .requested
            .iter()
            .filter_map(|&id| built[id].clone())
            .collect();
        debug!(
            "[Recipe] {} built DAG for {} over {} nodes ({} free inputs)",
            self.name,
            problem,
            plan.order.len(),
            inputs.len()
        );
        Ok(ComputeDag { inputs, outputs, cache })
    }

    fn intrinsic(&self, shape_key: &str, capsule_key: &str, options: &IntrinsicOptions) -> Result<Intrinsic> {
        let problem = self.problem_size(shape_key)?;
        let capsule = self.capsule(capsule_key)?;
        let io = self.io(capsule_key, &problem)?;
        let (ldm, layout) = match capsule.kind() {
            CapsuleKind::LoadA => (Some(problem.q), Some(ConvLayout::Chw)),
            CapsuleKind::LoadB => (Some(problem.c), Some(ConvLayout::Chw)),
            CapsuleKind::Store => (Some(problem.q), Some(ConvLayout::MemChw)),
            CapsuleKind::Mma => (None, None),
        };
        let ldm = options.leading_dimension.or(ldm);
        let tag = options.layout.as_deref().or(layout.map(ConvLayout::tag));
        let tile = options.tile.unwrap_or(self.target.tile);
        capsule.intrinsic(&io, &problem, ldm, tag, tile)
    }

    fn memory_scope_realize(
        &self,
        dtype: DType,
        scope: MemoryScope,
        elements: usize,
        attributes: &ScopeAttributes,
    ) -> Result<ScopeRealization> {
        let role = match scope {
            MemoryScope::Fragment(role) => role,
            other => {
                return Err(TensorizeError::InvalidSchedule(format!(
                    "`{}` is not a fragment scope; {} only realizes fragments",
                    other, self.name
                )))
            }
        };
        let (producer, default_layout) = match role {
            FragmentRole::OperandA => ("load_a", FragmentLayout::RowMajor),
            FragmentRole::OperandB => ("load_b", FragmentLayout::ColMajor),
            FragmentRole::Accumulator => (self.anchor.key(), FragmentLayout::RowMajor),
        };
        let expected = self.output_dtypes(producer)?[0];
        if dtype != expected {
            return Err(TensorizeError::UnsupportedDtype(format!(
                "{} in {} (recipe {} keeps {} there)",
                dtype, scope, self.name, expected
            )));
        }

        let tile = self.target.tile;
        let per_fragment = role.elements(tile);
        if elements == 0 || elements % per_fragment != 0 {
            return Err(TensorizeError::ShapeMismatch {
                context: format!("{} buffer of {}", scope, self.name),
                expected: format!("a multiple of {} elements", per_fragment),
                actual: elements.to_string(),
            });
        }

        let fragment = Fragment {
            role,
            layout: attributes.layout.unwrap_or(default_layout),
            tile,
            dtype,
            leading_dimension: attributes.leading_dimension.unwrap_or(match role {
                FragmentRole::Accumulator => tile.n,
                _ => tile.k,
            }),
        };
        Ok(ScopeRealization {
            type_name: fragment.type_name(),
            count: elements / per_fragment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::IntrinsicOp;

    const KEY: &str = "16x4x4x16x1x1";

    #[test]
    fn test_variant_names() {
        assert_eq!(TenetConvRecipe::fp16_fp16().unwrap().name(), "tenet_conv_fp16_fp16");
        let int4 = TenetConvRecipe::new(DType::Int4, DType::Int32).unwrap();
        assert_eq!(int4.name(), "tenet_conv_int4_int32");
        assert_eq!(int4.target().tile, TileShape::new(8, 8, 32));
        assert_eq!(int4.output_dtypes("mma").unwrap(), &[DType::Int32]);
    }

    #[test]
    fn test_narrowing_tables_are_rejected() {
        let recipe = TenetConvRecipe::fp16_fp16().unwrap();
        let mut outputs = recipe.output_dtypes.clone();
        let mut inputs = recipe.input_dtypes.clone();
        outputs.insert("mma".into(), vec![DType::Float16]);
        inputs.insert("store".into(), vec![DType::Float16]);
        let err = TenetConvRecipe::with_tables("narrow", inputs, outputs, HardwareTarget::volta()).unwrap_err();
        assert!(matches!(err, TensorizeError::NarrowingAccumulator { .. }));
    }

    #[test]
    fn test_edge_dtype_disagreement_is_rejected() {
        let recipe = TenetConvRecipe::fp16_fp16().unwrap();
        let mut inputs = recipe.input_dtypes.clone();
        inputs.insert("store".into(), vec![DType::Float16]);
        let err = TenetConvRecipe::with_tables("broken", inputs, recipe.output_dtypes.clone(), HardwareTarget::volta())
            .unwrap_err();
        assert!(matches!(err, TensorizeError::InvalidGraph(msg) if msg.contains("`mma` produces float32")));
    }

    #[test]
    fn test_intrinsic_default_leading_dimensions() {
        let recipe = TenetConvRecipe::fp16_fp16().unwrap();
        let problem = ShapeKey::parse("16x4x8x32x1x1").unwrap();
        let key = problem.to_string();
        let opts = IntrinsicOptions::default();

        let a = recipe.intrinsic(&key, "load_a", &opts).unwrap();
        assert_eq!(a.leading_dimension, Some(8));
        assert_eq!(a.layout, Some(ConvLayout::Chw));
        let b = recipe.intrinsic(&key, "load_b", &opts).unwrap();
        assert_eq!(b.leading_dimension, Some(32));
        let c = recipe.intrinsic(&key, "store", &opts).unwrap();
        assert_eq!(c.layout, Some(ConvLayout::MemChw));
        let mma = recipe.intrinsic(&key, "mma", &opts).unwrap();
        assert_eq!(mma.init, Some(IntrinsicOp::FillFragment));

        let overridden = recipe
            .intrinsic(&key, "load_a", &IntrinsicOptions::default().with_leading_dimension(64))
            .unwrap();
        assert_eq!(overridden.inputs[0].strides[0], 64);
    }

    #[test]
    fn test_unknown_capsule() {
        let recipe = TenetConvRecipe::fp16_fp16().unwrap();
        let err = recipe.intrinsic(KEY, "nonexistent", &IntrinsicOptions::default()).unwrap_err();
        assert_eq!(
            err,
            TensorizeError::UnknownCapsule {
                recipe: "tenet_conv_fp16_fp16".into(),
                capsule: "nonexistent".into()
            }
        );
    }

    #[test]
    fn test_custom_shape_refused_for_anchor() {
        let recipe = TenetConvRecipe::fp16_fp16().unwrap();
        let err = recipe
            .capsule_compute_expression_with_shape(KEY, "mma", &[vec![16, 4, 4]], &[vec![16, 4, 4]])
            .unwrap_err();
        assert!(matches!(err, TensorizeError::InvalidGraph(_)));

        let (inputs, out) = recipe
            .capsule_compute_expression_with_shape(KEY, "load_a", &[vec![16, 2, 4]], &[vec![16, 2, 4]])
            .unwrap();
        assert_eq!(inputs[0].shape(), &[16, 2, 4]);
        assert_eq!(out.shape(), &[16, 2, 4]);
    }

    #[test]
    fn test_dag_build_is_idempotent() {
        let recipe = TenetConvRecipe::fp16_fp16().unwrap();
        let first = recipe.dag_compute_expression_with_inputs(KEY, &["store"], recipe.edges()).unwrap();
        let second = recipe.dag_compute_expression_with_inputs(KEY, &["store"], recipe.edges()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.cache.len(), 6);
        let names: Vec<&str> = first.inputs.iter().map(Tensor::name).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn test_dag_without_edges_uses_root_placeholders() {
        let recipe = TenetConvRecipe::fp16_fp16().unwrap();
        let dag = recipe.dag_compute_expression_with_inputs(KEY, &["mma"], &EdgeMap::new()).unwrap();
        assert_eq!(dag.inputs.len(), 2);
        assert_eq!(dag.outputs[0].dtype(), DType::Float32);
    }

    #[test]
    fn test_memory_scope_realize() {
        let recipe = TenetConvRecipe::fp16_fp16().unwrap();
        let realized = recipe
            .memory_scope_realize(
                DType::Float16,
                MemoryScope::Fragment(FragmentRole::OperandA),
                512,
                &ScopeAttributes::default(),
            )
            .unwrap();
        assert_eq!(
            realized.type_name,
            "tenet::conv::fragment<tenet::conv::matrix_a, 16, 16, 16, tenet::conv::row_major, 16>"
        );
        assert_eq!(realized.count, 2);

        let err = recipe
            .memory_scope_realize(
                DType::Float16,
                MemoryScope::Fragment(FragmentRole::Accumulator),
                256,
                &ScopeAttributes::default(),
            )
            .unwrap_err();
        assert!(matches!(err, TensorizeError::UnsupportedDtype(_)));

        let err = recipe
            .memory_scope_realize(DType::Float16, MemoryScope::Shared, 256, &ScopeAttributes::default())
            .unwrap_err();
        assert!(matches!(err, TensorizeError::InvalidSchedule(_)));
    }
}
