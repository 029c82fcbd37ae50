use thiserror::Error;

use crate::core::dtype::DType;

/// Every failure the recipe, planner and synthesizer layers can report.
///
/// All of these are configuration defects raised at build time. None of them
/// is retried and no partially built DAG or schedule is ever returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorizeError {
    #[error("malformed shape key `{key}`: {reason}")]
    MalformedShapeKey { key: String, reason: String },

    #[error("unknown capsule `{capsule}` in recipe `{recipe}`")]
    UnknownCapsule { recipe: String, capsule: String },

    #[error("shape mismatch in `{context}`: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("arity mismatch for capsule `{capsule}`: expected {expected} inputs, got {actual}")]
    ArityMismatch {
        capsule: String,
        expected: usize,
        actual: usize,
    },

    #[error("unsupported layout `{layout}` for capsule `{capsule}`")]
    UnsupportedLayout { capsule: String, layout: String },

    #[error("infeasible factorization of `{dim}` (extent {total}) with factors {factors:?}: {reason}")]
    InfeasibleFactorization {
        dim: String,
        factors: Vec<usize>,
        total: usize,
        reason: String,
    },

    #[error("split of `{loop_name}` in stage `{stage}` into {nparts} parts does not divide extent {extent}")]
    IndivisibleSplit {
        stage: String,
        loop_name: String,
        extent: usize,
        nparts: usize,
    },

    #[error("capsule `{capsule}` accumulates {input} into {accumulator}, expected at least {required}")]
    NarrowingAccumulator {
        capsule: String,
        input: DType,
        accumulator: DType,
        required: DType,
    },

    #[error("unsupported dtype `{0}`")]
    UnsupportedDtype(String),

    #[error("invalid capsule graph: {0}")]
    InvalidGraph(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("unknown recipe `{0}`")]
    UnknownRecipe(String),

    #[error("recipe `{0}` is already registered")]
    DuplicateRecipe(String),

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for TensorizeError {
    fn from(err: serde_json::Error) -> Self {
        TensorizeError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TensorizeError>;
