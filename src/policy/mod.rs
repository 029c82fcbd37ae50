//! Tiling policy: how the loop extents are factorised for the target.

pub mod tile;

pub use tile::{ProblemExtents, TilePlan, TilePlanner};
