//! # Core Abstractions
//!
//! The operator, its element types and the machine it runs on.
//!
//! - **[`op`]:** Conv2d operator definition and its tensor-expression builders.
//! - **[`shape`]:** `KxPxQxCxRxS` shape keys of the capsule problem.
//! - **[`dtype`]:** Element types and accumulator promotion.
//! - **[`device`]:** Hardware target and instruction tile.
//! - **[`config`]:** Tile factors and synthesis options, loadable from JSON.

pub mod config;
pub mod device;
pub mod dtype;
pub mod op;
pub mod shape;
