//! # Capsule Library
//!
//! A capsule is one primitive sub-computation of a recipe that maps onto
//! exactly one tensor-core instruction. Every capsule exposes two builders:
//!
//! - a pure compute-expression builder, used to assemble and check the DAG;
//! - an intrinsic builder, used by the schedule synthesizer to tensorize.
//!
//! Dispatch is a closed enum: each kind carries its own parameter struct and
//! every `match` over [`Capsule`] is checked exhaustively.

pub mod intrinsic;
pub mod load;
pub mod mma;
pub mod store;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::device::TileShape;
use crate::core::dtype::DType;
use crate::core::shape::ShapeKey;
use crate::error::{Result, TensorizeError};
use crate::te::{placeholder, Expr, Tensor};

pub use intrinsic::{BufferBinding, ConvLayout, Intrinsic, IntrinsicOp};
pub use load::LoadParams;
pub use mma::MmaParams;
pub use store::StoreParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CapsuleKind {
    LoadA,
    LoadB,
    Mma,
    Store,
}

impl CapsuleKind {
    pub const ALL: [CapsuleKind; 4] = [Self::LoadA, Self::LoadB, Self::Mma, Self::Store];

    /// Key the capsule is registered under in a recipe.
    pub fn key(self) -> &'static str {
        match self {
            Self::LoadA => "load_a",
            Self::LoadB => "load_b",
            Self::Mma => "mma",
            Self::Store => "store",
        }
    }

    pub fn fan_in(self) -> usize {
        match self {
            Self::Mma => 2,
            Self::LoadA | Self::LoadB | Self::Store => 1,
        }
    }
}

impl fmt::Display for CapsuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// The three sub-tensors of one capsule problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    /// Image, `[C, P, Q]`.
    A,
    /// Filter tap, `[K, C]`.
    B,
    /// Output, `[K, P, Q]`.
    C,
}

impl Operand {
    pub fn shape(self, problem: &ShapeKey) -> Vec<usize> {
        match self {
            Self::A => problem.a_shape(),
            Self::B => problem.b_shape(),
            Self::C => problem.c_shape(),
        }
    }

    pub fn axis_names(self) -> &'static [&'static str] {
        match self {
            Self::A => &["c", "p", "q"],
            Self::B => &["k", "c"],
            Self::C => &["k", "p", "q"],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
        }
    }
}

/// Shapes and dtypes a capsule is instantiated with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleIo {
    pub input_shapes: Vec<Vec<usize>>,
    pub output_shapes: Vec<Vec<usize>>,
    pub input_dtypes: Vec<DType>,
    pub output_dtypes: Vec<DType>,
}

impl CapsuleIo {
    pub fn new(
        input_shapes: Vec<Vec<usize>>,
        output_shapes: Vec<Vec<usize>>,
        input_dtypes: Vec<DType>,
        output_dtypes: Vec<DType>,
    ) -> Self {
        Self { input_shapes, output_shapes, input_dtypes, output_dtypes }
    }

    pub fn output_dtype(&self) -> DType {
        self.output_dtypes[0]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Capsule {
    LoadA(LoadParams),
    LoadB(LoadParams),
    Mma(MmaParams),
    Store(StoreParams),
}

impl Capsule {
    pub fn load_a() -> Self {
        Self::LoadA(LoadParams::operand_a())
    }

    pub fn load_b() -> Self {
        Self::LoadB(LoadParams::operand_b())
    }

    pub fn mma() -> Self {
        Self::Mma(MmaParams::default())
    }

    pub fn store() -> Self {
        Self::Store(StoreParams::default())
    }

    pub fn of_kind(kind: CapsuleKind) -> Self {
        match kind {
            CapsuleKind::LoadA => Self::load_a(),
            CapsuleKind::LoadB => Self::load_b(),
            CapsuleKind::Mma => Self::mma(),
            CapsuleKind::Store => Self::store(),
        }
    }

    pub fn kind(&self) -> CapsuleKind {
        match self {
            Self::LoadA(_) => CapsuleKind::LoadA,
            Self::LoadB(_) => CapsuleKind::LoadB,
            Self::Mma(_) => CapsuleKind::Mma,
            Self::Store(_) => CapsuleKind::Store,
        }
    }

    pub fn fan_in(&self) -> usize {
        self.kind().fan_in()
    }

    /// Builds the capsule over fresh placeholders.
    pub fn compute_expression(&self, io: &CapsuleIo, problem: &ShapeKey) -> Result<(Vec<Tensor>, Tensor)> {
        self.check_io(io, problem)?;
        let inputs: Vec<Tensor> = io
            .input_shapes
            .iter()
            .zip(&io.input_dtypes)
            .zip(self.input_names())
            .map(|((shape, dtype), name)| placeholder(shape, *dtype, name))
            .collect();
        let output = self.build(&inputs, io)?;
        Ok((inputs, output))
    }

    /// Builds the capsule over tensors produced upstream in the DAG.
    pub fn compute_expression_with_inputs(
        &self,
        inputs: &[Tensor],
        io: &CapsuleIo,
        problem: &ShapeKey,
    ) -> Result<(Vec<Tensor>, Tensor)> {
        if inputs.len() != self.fan_in() {
            return Err(TensorizeError::ArityMismatch {
                capsule: self.kind().key().to_string(),
                expected: self.fan_in(),
                actual: inputs.len(),
            });
        }
        self.check_io(io, problem)?;
        for (i, input) in inputs.iter().enumerate() {
            if input.shape() != io.input_shapes[i].as_slice() {
                return Err(TensorizeError::ShapeMismatch {
                    context: format!("input {} (`{}`) of capsule `{}`", i, input.name(), self.kind()),
                    expected: format!("{:?}", io.input_shapes[i]),
                    actual: format!("{:?}", input.shape()),
                });
            }
            if input.dtype() != io.input_dtypes[i] {
                return Err(TensorizeError::InvalidGraph(format!(
                    "capsule `{}` expects input {} as {}, upstream `{}` produces {}",
                    self.kind(),
                    i,
                    io.input_dtypes[i],
                    input.name(),
                    input.dtype()
                )));
            }
        }
        let output = self.build(inputs, io)?;
        Ok((inputs.to_vec(), output))
    }

    /// Binds the capsule's access pattern to its hardware instruction.
    ///
    /// `leading_dimension` and `layout_tag` are required by the load and store
    /// capsules and ignored by `mma`, whose operands are already fragments.
    pub fn intrinsic(
        &self,
        io: &CapsuleIo,
        problem: &ShapeKey,
        leading_dimension: Option<usize>,
        layout_tag: Option<&str>,
        tile: TileShape,
    ) -> Result<Intrinsic> {
        self.check_io(io, problem)?;
        match self {
            Self::LoadA(params) | Self::LoadB(params) => {
                let (ldm, layout) = self.access_pattern(leading_dimension, layout_tag)?;
                Ok(params.intrinsic(self.kind(), io, ldm, layout, tile))
            }
            Self::Mma(params) => params.intrinsic(io, tile),
            Self::Store(params) => {
                let (ldm, layout) = self.access_pattern(leading_dimension, layout_tag)?;
                Ok(params.intrinsic(io, ldm, layout, tile))
            }
        }
    }

    fn access_pattern(&self, leading_dimension: Option<usize>, layout_tag: Option<&str>) -> Result<(usize, ConvLayout)> {
        let key = self.kind().key();
        let layout = match layout_tag {
            Some(tag) => ConvLayout::parse(tag, key)?,
            None => {
                return Err(TensorizeError::UnsupportedLayout {
                    capsule: key.to_string(),
                    layout: "<missing>".to_string(),
                })
            }
        };
        match leading_dimension {
            Some(ldm) if ldm > 0 => Ok((ldm, layout)),
            other => Err(TensorizeError::ShapeMismatch {
                context: format!("leading dimension of capsule `{}`", key),
                expected: "a positive leading dimension".to_string(),
                actual: format!("{:?}", other),
            }),
        }
    }

    fn input_names(&self) -> &'static [&'static str] {
        match self {
            Self::LoadA(_) => &["A"],
            Self::LoadB(_) => &["B"],
            Self::Mma(_) => &["A", "B"],
            Self::Store(_) => &["acc"],
        }
    }

    fn build(&self, inputs: &[Tensor], io: &CapsuleIo) -> Result<Tensor> {
        match self {
            Self::LoadA(params) | Self::LoadB(params) => Ok(params.build(self.kind(), &inputs[0], io)),
            Self::Mma(params) => params.build(&inputs[0], &inputs[1], io),
            Self::Store(params) => Ok(params.build(&inputs[0], io)),
        }
    }

    fn check_io(&self, io: &CapsuleIo, problem: &ShapeKey) -> Result<()> {
        let key = self.kind().key();
        let fan_in = self.fan_in();
        if io.input_shapes.len() != fan_in || io.input_dtypes.len() != fan_in {
            return Err(TensorizeError::ArityMismatch {
                capsule: key.to_string(),
                expected: fan_in,
                actual: io.input_shapes.len().max(io.input_dtypes.len()),
            });
        }
        if io.output_shapes.len() != 1 || io.output_dtypes.len() != 1 {
            return Err(TensorizeError::ArityMismatch {
                capsule: key.to_string(),
                expected: 1,
                actual: io.output_shapes.len(),
            });
        }

        match self {
            Self::LoadA(params) | Self::LoadB(params) => {
                check_slice(key, params.operand, &io.input_shapes[0], problem)?;
                check_same(key, &io.input_shapes[0], &io.output_shapes[0])
            }
            Self::Store(_) => {
                check_slice(key, Operand::C, &io.input_shapes[0], problem)?;
                check_same(key, &io.input_shapes[0], &io.output_shapes[0])
            }
            Self::Mma(_) => {
                let (a, b, c) = (&io.input_shapes[0], &io.input_shapes[1], &io.output_shapes[0]);
                check_slice(key, Operand::A, a, problem)?;
                check_slice(key, Operand::B, b, problem)?;
                check_slice(key, Operand::C, c, problem)?;
                // A[c,p,q] x B[k,c] -> C[k,p,q]
                if a[0] != b[1] || b[0] != c[0] || a[1] != c[1] || a[2] != c[2] {
                    return Err(TensorizeError::ShapeMismatch {
                        context: format!("operands of capsule `{}`", key),
                        expected: "A[c,p,q] x B[k,c] -> C[k,p,q]".to_string(),
                        actual: format!("A{:?} x B{:?} -> C{:?}", a, b, c),
                    });
                }
                Ok(())
            }
        }
    }
}

/// A shape is a valid slice of an operand if it has the operand's rank and
/// every extent tiles the operand's extent exactly.
fn check_slice(capsule: &str, operand: Operand, shape: &[usize], problem: &ShapeKey) -> Result<()> {
    let full = operand.shape(problem);
    let consistent = shape.len() == full.len()
        && shape.iter().zip(&full).all(|(&s, &f)| s > 0 && f % s == 0);
    if !consistent {
        return Err(TensorizeError::ShapeMismatch {
            context: format!("operand {} of capsule `{}` for problem {}", operand.name(), capsule, problem),
            expected: format!("a slice of {:?}", full),
            actual: format!("{:?}", shape),
        });
    }
    Ok(())
}

fn check_same(capsule: &str, input: &[usize], output: &[usize]) -> Result<()> {
    if input != output {
        return Err(TensorizeError::ShapeMismatch {
            context: format!("output of capsule `{}`", capsule),
            expected: format!("{:?}", input),
            actual: format!("{:?}", output),
        });
    }
    Ok(())
}

pub(crate) fn cast_if_needed(value: Expr, dtype: DType) -> Expr {
    if value.dtype() == dtype {
        value
    } else {
        value.cast(dtype)
    }
}
