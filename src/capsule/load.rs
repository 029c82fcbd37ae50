use serde::{Deserialize, Serialize};

use crate::capsule::intrinsic::{bytes_of, BufferBinding, ConvLayout, Intrinsic, IntrinsicOp};
use crate::capsule::{cast_if_needed, CapsuleIo, CapsuleKind, Operand};
use crate::core::device::TileShape;
use crate::semantic::fragment::{FragmentLayout, FragmentRole, MemoryScope};
use crate::te::{compute_named, Tensor};

/// Global/shared to fragment copy of one matrix operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadParams {
    pub operand: Operand,
    pub role: FragmentRole,
    pub fragment_layout: FragmentLayout,
}

impl LoadParams {
    pub fn operand_a() -> Self {
        Self {
            operand: Operand::A,
            role: FragmentRole::OperandA,
            fragment_layout: FragmentLayout::RowMajor,
        }
    }

    pub fn operand_b() -> Self {
        Self {
            operand: Operand::B,
            role: FragmentRole::OperandB,
            fragment_layout: FragmentLayout::ColMajor,
        }
    }

    /// Identity copy, cast only when the declared dtypes differ.
    pub(crate) fn build(&self, kind: CapsuleKind, input: &Tensor, io: &CapsuleIo) -> Tensor {
        let dtype = io.output_dtype();
        compute_named(&io.output_shapes[0], self.operand.axis_names(), kind.key(), |ax| {
            cast_if_needed(input.load(ax.to_vec()), dtype)
        })
    }

    /// `tvm_load_matrix_sync` from a shared tile into an operand fragment.
    ///
    /// Operand A is viewed as `[m, k]`, operand B as `[n, k]`.
    pub(crate) fn intrinsic(
        &self,
        kind: CapsuleKind,
        io: &CapsuleIo,
        ldm: usize,
        layout: ConvLayout,
        tile: TileShape,
    ) -> Intrinsic {
        let rows = match self.role {
            FragmentRole::OperandB => tile.n,
            _ => tile.m,
        };
        let shape = vec![rows, tile.k, 1, 1];
        let src = BufferBinding::new(
            MemoryScope::Shared,
            shape.clone(),
            io.input_dtypes[0],
            bytes_of(tile.k, io.input_dtypes[0]),
            tile.k,
        )
        .with_leading_dimension(ldm);
        let dst = BufferBinding::new(
            MemoryScope::Fragment(self.role),
            shape,
            io.output_dtype(),
            bytes_of(tile.k, io.output_dtype()),
            tile.k,
        );

        Intrinsic {
            capsule: kind,
            op: IntrinsicOp::LoadMatrixSync,
            init: None,
            tile,
            inputs: vec![src],
            outputs: vec![dst],
            fragment_layout: Some(self.fragment_layout),
            layout: Some(layout),
            leading_dimension: Some(ldm),
            nest: vec![rows, tile.k],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::Capsule;
    use crate::core::dtype::DType;
    use crate::core::shape::ShapeKey;

    #[test]
    fn test_load_b_intrinsic_is_col_major() {
        let problem = ShapeKey::parse("16x4x4x16x3x3").unwrap();
        let io = CapsuleIo::new(
            vec![problem.b_shape()],
            vec![problem.b_shape()],
            vec![DType::Float16],
            vec![DType::Float16],
        );
        let intrin = Capsule::load_b()
            .intrinsic(&io, &problem, Some(64), Some("tenet::conv::chw"), TileShape::default())
            .unwrap();
        assert_eq!(intrin.op, IntrinsicOp::LoadMatrixSync);
        assert_eq!(intrin.fragment_layout, Some(FragmentLayout::ColMajor));
        assert_eq!(intrin.inputs[0].strides, vec![64, 1, 1, 1]);
        assert_eq!(intrin.inputs[0].data_alignment, 32);
        assert_eq!(intrin.outputs[0].scope, MemoryScope::Fragment(FragmentRole::OperandB));
        assert_eq!(intrin.nest, vec![16, 16]);
    }

    #[test]
    fn test_load_casts_only_on_dtype_change() {
        let problem = ShapeKey::parse("16x4x4x16x1x1").unwrap();
        let same = CapsuleIo::new(
            vec![problem.a_shape()],
            vec![problem.a_shape()],
            vec![DType::Float16],
            vec![DType::Float16],
        );
        let (_, out) = Capsule::load_a().compute_expression(&same, &problem).unwrap();
        assert_eq!(out.dtype(), DType::Float16);
        assert!(!format!("{:?}", out.body()).contains("Cast"));

        let widen = CapsuleIo { output_dtypes: vec![DType::Float32], ..same };
        let (_, out) = Capsule::load_a().compute_expression(&widen, &problem).unwrap();
        assert_eq!(out.dtype(), DType::Float32);
    }
}
