//! # Tensor Expressions
//!
//! The small expression algebra capsules and operators are written in:
//! placeholders, element-wise and reduction compute definitions, casts and
//! guarded selects. [`eval`] interprets it on the CPU as a reference.

pub mod eval;
pub mod expr;
pub mod tensor;

pub use eval::Evaluator;
pub use expr::{reduce_axis, select, sum, Affine, BinOp, Expr, IterKind, IterVar};
pub use tensor::{compute, compute_named, placeholder, Tensor, TensorDesc, TensorOp};
