use serde::{Deserialize, Serialize};

use crate::semantic::fragment::MemoryScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRequirement {
    None,
    /// `__syncthreads()` equivalent.
    Barrier,
}

/// Movement of one staged tile from a producer scope to a consumer scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
    pub from: MemoryScope,
    pub to: MemoryScope,
}

impl PhaseTransition {
    pub fn new(from: MemoryScope, to: MemoryScope) -> Self {
        Self { from, to }
    }

    /// Threads of a block write shared memory cooperatively, so any reader of
    /// it must wait for every writer of the block.
    pub fn required_sync(&self) -> SyncRequirement {
        match (self.from, self.to) {
            (MemoryScope::Shared, to) if to != MemoryScope::Shared => SyncRequirement::Barrier,
            _ => SyncRequirement::None,
        }
    }
}
