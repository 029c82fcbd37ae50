use serde::{Deserialize, Serialize};

use crate::capsule::intrinsic::{bytes_of, BufferBinding, Intrinsic, IntrinsicOp};
use crate::capsule::{CapsuleIo, CapsuleKind};
use crate::core::device::TileShape;
use crate::error::Result;
use crate::semantic::fragment::{FragmentLayout, FragmentRole, MemoryScope};
use crate::te::{compute_named, reduce_axis, sum, Tensor};

/// Fragment-level multiply-accumulate, `C[k,p,q] += A[c,p,q] * B[k,c]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmaParams {
    pub a_layout: FragmentLayout,
    pub b_layout: FragmentLayout,
}

impl Default for MmaParams {
    fn default() -> Self {
        Self {
            a_layout: FragmentLayout::RowMajor,
            b_layout: FragmentLayout::ColMajor,
        }
    }
}

impl MmaParams {
    /// Both operands are promoted to the accumulator type before the product.
    pub(crate) fn build(&self, a: &Tensor, b: &Tensor, io: &CapsuleIo) -> Result<Tensor> {
        let acc = io.output_dtype();
        let key = CapsuleKind::Mma.key();
        io.input_dtypes[0].check_accumulator(acc, key)?;
        io.input_dtypes[1].check_accumulator(acc, key)?;

        let rc = reduce_axis(a.shape()[0], "rc");
        Ok(compute_named(&io.output_shapes[0], &["k", "p", "q"], key, |ax| {
            let (k, p, q) = (ax[0].clone(), ax[1].clone(), ax[2].clone());
            let lhs = a.load(vec![rc.expr(), p, q]).cast(acc);
            let rhs = b.load(vec![k, rc.expr()]).cast(acc);
            sum(lhs * rhs, &[rc.clone()])
        }))
    }

    /// `tvm_mma_sync` over fragments, zero-filled once by `tvm_fill_fragment`.
    pub(crate) fn intrinsic(&self, io: &CapsuleIo, tile: TileShape) -> Result<Intrinsic> {
        let acc = io.output_dtype();
        let key = CapsuleKind::Mma.key();
        io.input_dtypes[0].check_accumulator(acc, key)?;
        io.input_dtypes[1].check_accumulator(acc, key)?;

        let (a_ty, b_ty) = (io.input_dtypes[0], io.input_dtypes[1]);
        let a = BufferBinding::new(
            MemoryScope::Fragment(FragmentRole::OperandA),
            vec![tile.m, tile.k, 1, 1],
            a_ty,
            bytes_of(tile.k, a_ty),
            tile.m * tile.k,
        );
        let b = BufferBinding::new(
            MemoryScope::Fragment(FragmentRole::OperandB),
            vec![tile.n, tile.k, 1, 1],
            b_ty,
            bytes_of(tile.k, b_ty),
            tile.n * tile.k,
        );
        let c = BufferBinding::new(
            MemoryScope::Fragment(FragmentRole::Accumulator),
            vec![tile.m, tile.n, 1, 1],
            acc,
            bytes_of(tile.n, acc),
            tile.m * tile.n,
        );

        Ok(Intrinsic {
            capsule: CapsuleKind::Mma,
            op: IntrinsicOp::MmaSync,
            init: Some(IntrinsicOp::FillFragment),
            tile,
            inputs: vec![a, b],
            outputs: vec![c],
            fragment_layout: None,
            layout: None,
            leading_dimension: None,
            nest: vec![tile.m, tile.n, tile.k],
        })
    }
}
