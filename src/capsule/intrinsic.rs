use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capsule::CapsuleKind;
use crate::core::device::TileShape;
use crate::core::dtype::DType;
use crate::error::{Result, TensorizeError};
use crate::semantic::fragment::{FragmentLayout, MemoryScope};

/// Memory layout conventions understood by the conv capsules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvLayout {
    /// `tenet::conv::chw`: channel-major, then row-major height/width.
    Chw,
    /// `tenet::conv::mem_chw`: the same order for a buffer written back to memory.
    MemChw,
}

impl ConvLayout {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Chw => "tenet::conv::chw",
            Self::MemChw => "tenet::conv::mem_chw",
        }
    }

    pub fn parse(tag: &str, capsule: &str) -> Result<Self> {
        match tag {
            "tenet::conv::chw" => Ok(Self::Chw),
            "tenet::conv::mem_chw" => Ok(Self::MemChw),
            other => Err(TensorizeError::UnsupportedLayout {
                capsule: capsule.to_string(),
                layout: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ConvLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntrinsicOp {
    LoadMatrixSync,
    MmaSync,
    StoreMatrixSync,
    FillFragment,
}

impl IntrinsicOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::LoadMatrixSync => "tvm_load_matrix_sync",
            Self::MmaSync => "tvm_mma_sync",
            Self::StoreMatrixSync => "tvm_store_matrix_sync",
            Self::FillFragment => "tvm_fill_fragment",
        }
    }
}

/// A buffer an intrinsic reads or writes, with its access pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferBinding {
    pub scope: MemoryScope,
    pub shape: Vec<usize>,
    pub dtype: DType,
    /// Element strides, outermost first.
    pub strides: Vec<usize>,
    /// Bytes.
    pub data_alignment: usize,
    /// Elements.
    pub offset_factor: usize,
}

impl BufferBinding {
    pub(crate) fn new(scope: MemoryScope, shape: Vec<usize>, dtype: DType, row_bytes: usize, offset_factor: usize) -> Self {
        let strides = dense_strides(&shape);
        Self {
            scope,
            shape,
            dtype,
            strides,
            data_alignment: row_bytes,
            offset_factor,
        }
    }

    pub(crate) fn with_leading_dimension(mut self, ldm: usize) -> Self {
        if let Some(first) = self.strides.first_mut() {
            *first = ldm;
        }
        self
    }
}

fn dense_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// Bytes covered by `elements` values of `dtype`, rounded up.
pub(crate) fn bytes_of(elements: usize, dtype: DType) -> usize {
    (elements * dtype.bits() as usize + 7) / 8
}

/// Opaque-to-clients description of one tensor-core instruction binding.
///
/// The lowering backend substitutes the loop nest a stage is tensorized at
/// with `op`, reading `inputs` and writing `outputs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intrinsic {
    pub capsule: CapsuleKind,
    pub op: IntrinsicOp,
    /// Issued once before the first update (accumulator zero-fill).
    pub init: Option<IntrinsicOp>,
    pub tile: TileShape,
    pub inputs: Vec<BufferBinding>,
    pub outputs: Vec<BufferBinding>,
    pub fragment_layout: Option<FragmentLayout>,
    pub layout: Option<ConvLayout>,
    pub leading_dimension: Option<usize>,
    /// Non-unit loop extents of the nest this intrinsic replaces, outermost first.
    pub nest: Vec<usize>,
}

impl Intrinsic {
    pub fn name(&self) -> &'static str {
        self.op.name()
    }
}
