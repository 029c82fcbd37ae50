//! # Tensorize: Capsule Recipes and Tensor-Core Schedules
//!
//! Decomposes a convolution into matrix-unit "capsules" (fragment loads, a
//! multiply-accumulate, a fragment store), checks that the decomposition
//! computes what the operator computes, and synthesizes a global → shared →
//! fragment schedule that a lowering backend turns into device code.
//!
//! ## Core Modules
//!
//! - **[`core`]**: Operator, dtypes, shape keys, hardware target and configuration.
//! - **[`te`]**: A small tensor-expression IR with a reference evaluator.
//! - **[`capsule`]**: The four capsules and their intrinsic bindings.
//! - **[`recipe`]**: Compilation recipes, the capsule DAG builder and the registry.
//! - **[`policy`]**: Tile factorisation for the target.
//! - **[`schedule`]**: Schedule IR, region inference, validation and synthesis.

pub mod capsule;
pub mod core;
pub mod error;
pub mod policy;
pub mod recipe;
pub mod schedule;
pub mod semantic;
pub mod te;

pub use crate::core::config::{DimFactors, SynthesisConfig, TileFactors};
pub use crate::core::device::{HardwareTarget, TileShape};
pub use crate::core::dtype::DType;
pub use crate::core::op::{Conv2dOp, ConvTensors};
pub use crate::core::shape::ShapeKey;
pub use crate::error::{Result, TensorizeError};
pub use crate::recipe::{CompilationRecipe, ComputeDag, EdgeMap, IntrinsicOptions, RecipeRegistry, TenetConvRecipe};
pub use crate::schedule::{LaunchDims, LoweringInput, Schedule, ScheduleSynthesizer};
pub use crate::semantic::fragment::{Fragment, FragmentLayout, FragmentRole, MemoryScope};
pub use crate::semantic::transition::{PhaseTransition, SyncRequirement};
