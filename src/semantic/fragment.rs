use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::device::TileShape;
use crate::core::dtype::DType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FragmentRole {
    OperandA,
    OperandB,
    Accumulator,
}

impl FragmentRole {
    pub fn scope_name(self) -> &'static str {
        match self {
            Self::OperandA => "wmma.matrix_a",
            Self::OperandB => "wmma.matrix_b",
            Self::Accumulator => "wmma.accumulator",
        }
    }

    fn tenet_name(self) -> &'static str {
        match self {
            Self::OperandA => "tenet::conv::matrix_a",
            Self::OperandB => "tenet::conv::matrix_b",
            Self::Accumulator => "tenet::conv::accumulator",
        }
    }

    /// Elements of one fragment of this role.
    pub fn elements(self, tile: TileShape) -> usize {
        match self {
            Self::OperandA => tile.m * tile.k,
            Self::OperandB => tile.n * tile.k,
            Self::Accumulator => tile.m * tile.n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FragmentLayout {
    RowMajor,
    ColMajor,
}

impl FragmentLayout {
    pub fn name(self) -> &'static str {
        match self {
            Self::RowMajor => "row_major",
            Self::ColMajor => "col_major",
        }
    }
}

/// Where a staged buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryScope {
    Global,
    /// Block-visible scratchpad.
    Shared,
    /// Warp-private matrix-unit registers.
    Fragment(FragmentRole),
    /// Thread-private registers.
    Local,
}

impl MemoryScope {
    pub fn is_fragment(self) -> bool {
        matches!(self, Self::Fragment(_))
    }
}

impl fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Shared => f.write_str("shared"),
            Self::Fragment(role) => f.write_str(role.scope_name()),
            Self::Local => f.write_str("local"),
        }
    }
}

/// A fragment type as the backend declares it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub role: FragmentRole,
    pub layout: FragmentLayout,
    pub tile: TileShape,
    pub dtype: DType,
    pub leading_dimension: usize,
}

impl Fragment {
    /// Backend type name, e.g.
    /// `tenet::conv::fragment<tenet::conv::matrix_a, 16, 16, 16, tenet::conv::row_major, 16>`.
    pub fn type_name(&self) -> String {
        format!(
            "tenet::conv::fragment<{}, {}, {}, {}, tenet::conv::{}, {}>",
            self.role.tenet_name(),
            self.tile.m,
            self.tile.n,
            self.tile.k,
            self.layout.name(),
            self.leading_dimension
        )
    }
}
