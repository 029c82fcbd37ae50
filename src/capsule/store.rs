use serde::{Deserialize, Serialize};

use crate::capsule::intrinsic::{bytes_of, BufferBinding, ConvLayout, Intrinsic, IntrinsicOp};
use crate::capsule::{cast_if_needed, CapsuleIo, CapsuleKind, Operand};
use crate::core::device::TileShape;
use crate::semantic::fragment::{FragmentLayout, FragmentRole, MemoryScope};
use crate::te::{compute_named, Tensor};

/// Accumulator fragment to memory, cast to the output dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreParams {
    pub fragment_layout: FragmentLayout,
}

impl Default for StoreParams {
    fn default() -> Self {
        Self { fragment_layout: FragmentLayout::RowMajor }
    }
}

impl StoreParams {
    pub(crate) fn build(&self, acc: &Tensor, io: &CapsuleIo) -> Tensor {
        let dtype = io.output_dtype();
        compute_named(&io.output_shapes[0], Operand::C.axis_names(), "C", |ax| {
            cast_if_needed(acc.load(ax.to_vec()), dtype)
        })
    }

    pub(crate) fn intrinsic(&self, io: &CapsuleIo, ldm: usize, layout: ConvLayout, tile: TileShape) -> Intrinsic {
        let (acc, out) = (io.input_dtypes[0], io.output_dtype());
        let shape = vec![tile.m, tile.n, 1, 1];
        let src = BufferBinding::new(
            MemoryScope::Fragment(FragmentRole::Accumulator),
            shape.clone(),
            acc,
            bytes_of(tile.n, acc),
            tile.m * tile.n,
        );
        let dst = BufferBinding::new(MemoryScope::Local, shape, out, bytes_of(tile.n, out), tile.n)
            .with_leading_dimension(ldm);

        Intrinsic {
            capsule: CapsuleKind::Store,
            op: IntrinsicOp::StoreMatrixSync,
            init: None,
            tile,
            inputs: vec![src],
            outputs: vec![dst],
            fragment_layout: Some(self.fragment_layout),
            layout: Some(layout),
            leading_dimension: Some(ldm),
            nest: vec![tile.m, tile.n],
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::capsule::{Capsule, CapsuleIo, ConvLayout};
    use crate::core::device::TileShape;
    use crate::core::dtype::DType;
    use crate::core::shape::ShapeKey;
    use crate::semantic::fragment::MemoryScope;

    #[test]
    fn test_store_writes_back_with_cast() {
        let problem = ShapeKey::parse("16x4x4x16x1x1").unwrap();
        let io = CapsuleIo::new(
            vec![problem.c_shape()],
            vec![problem.c_shape()],
            vec![DType::Float32],
            vec![DType::Float16],
        );
        let (inputs, out) = Capsule::store().compute_expression(&io, &problem).unwrap();
        assert_eq!(inputs[0].name(), "acc");
        assert_eq!(out.name(), "C");
        assert_eq!(out.dtype(), DType::Float16);

        let intrin = Capsule::store()
            .intrinsic(&io, &problem, Some(16), Some("tenet::conv::mem_chw"), TileShape::default())
            .unwrap();
        assert_eq!(intrin.layout, Some(ConvLayout::MemChw));
        assert_eq!(intrin.outputs[0].scope, MemoryScope::Local);
        assert_eq!(intrin.outputs[0].strides[0], 16);
        assert_eq!(intrin.inputs[0].dtype, DType::Float32);
    }
}
