//! Reference CPU evaluator for tensor expressions.
//!
//! Values are carried as `f64` and rounded to each tensor's dtype when an
//! element is materialised, after every cast, and after every accumulation
//! step of a reduction. The evaluator is a correctness oracle for capsule
//! DAGs and operator definitions; it makes no attempt to be fast.

use std::collections::HashMap;

use ndarray::{ArrayD, IxDyn};

use crate::error::{Result, TensorizeError};
use crate::te::expr::{BinOp, Expr, IterVar};
use crate::te::tensor::{Tensor, TensorOp};

#[derive(Default)]
pub struct Evaluator {
    values: HashMap<usize, (Tensor, ArrayD<f64>)>,
}

type Env<'a> = Vec<(&'a str, i64)>;

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supplies data for a placeholder. Values are rounded to its dtype.
    pub fn bind(&mut self, tensor: &Tensor, data: ArrayD<f64>) -> Result<()> {
        if !tensor.is_placeholder() {
            return Err(TensorizeError::Evaluation(format!(
                "`{}` is computed and cannot be bound",
                tensor.name()
            )));
        }
        if data.shape() != tensor.shape() {
            return Err(TensorizeError::ShapeMismatch {
                context: format!("binding `{}`", tensor.name()),
                expected: format!("{:?}", tensor.shape()),
                actual: format!("{:?}", data.shape()),
            });
        }
        let dtype = tensor.dtype();
        let data = data.mapv(|v| dtype.round(v));
        self.values.insert(tensor.node_id(), (tensor.clone(), data));
        Ok(())
    }

    pub fn evaluate(&mut self, tensor: &Tensor) -> Result<ArrayD<f64>> {
        self.materialize(tensor)?;
        Ok(self.values[&tensor.node_id()].1.clone())
    }

    fn materialize(&mut self, tensor: &Tensor) -> Result<()> {
        if self.values.contains_key(&tensor.node_id()) {
            return Ok(());
        }
        let (axes, body) = match tensor.op() {
            TensorOp::Placeholder => {
                return Err(TensorizeError::Evaluation(format!(
                    "placeholder `{}` has no bound data",
                    tensor.name()
                )))
            }
            TensorOp::Compute { axes, body } => (axes, body),
        };

        for input in tensor.input_tensors() {
            self.materialize(&input)?;
        }

        let dtype = tensor.dtype();
        let mut out = ArrayD::<f64>::zeros(IxDyn(tensor.shape()));
        for (index, slot) in out.indexed_iter_mut() {
            let mut env: Env = axes
                .iter()
                .enumerate()
                .map(|(d, axis)| (axis.name.as_str(), index[d] as i64))
                .collect();
            *slot = dtype.round(self.eval_expr(body, &mut env)?);
        }
        self.values.insert(tensor.node_id(), (tensor.clone(), out));
        Ok(())
    }

    fn eval_expr<'a>(&self, expr: &'a Expr, env: &mut Env<'a>) -> Result<f64> {
        Ok(match expr {
            Expr::Int(v) => *v as f64,
            Expr::Float(v, _) => *v,
            Expr::Var(var) => lookup(env, var)? as f64,
            Expr::Cast(dtype, inner) => dtype.round(self.eval_expr(inner, env)?),
            Expr::Binary(op, lhs, rhs) => {
                let l = self.eval_expr(lhs, env)?;
                let r = self.eval_expr(rhs, env)?;
                match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Lt => bool_value(l < r),
                    BinOp::Ge => bool_value(l >= r),
                    BinOp::And => bool_value(l != 0.0 && r != 0.0),
                }
            }
            Expr::Select(cond, then, otherwise) => {
                // Only the taken branch is evaluated so guarded loads stay in bounds.
                if self.eval_expr(cond, env)? != 0.0 {
                    self.eval_expr(then, env)?
                } else {
                    self.eval_expr(otherwise, env)?
                }
            }
            Expr::Load(tensor, indices) => {
                let mut position = Vec::with_capacity(indices.len());
                for (dim, index) in indices.iter().enumerate() {
                    let i = self.eval_expr(index, env)? as i64;
                    if i < 0 || i as usize >= tensor.shape()[dim] {
                        return Err(TensorizeError::Evaluation(format!(
                            "index {} out of bounds for dimension {} of `{}` {:?}",
                            i,
                            dim,
                            tensor.name(),
                            tensor.shape()
                        )));
                    }
                    position.push(i as usize);
                }
                let (_, data) = self.values.get(&tensor.node_id()).ok_or_else(|| {
                    TensorizeError::Evaluation(format!("`{}` was not materialised", tensor.name()))
                })?;
                data[IxDyn(&position)]
            }
            Expr::Sum(body, axes) => {
                let dtype = body.dtype();
                let base = env.len();
                for axis in axes {
                    env.push((axis.name.as_str(), 0));
                }
                let mut acc = 0.0;
                loop {
                    acc = dtype.round(acc + self.eval_expr(body, env)?);
                    if !advance(&mut env[base..], axes) {
                        break;
                    }
                }
                env.truncate(base);
                acc
            }
        })
    }
}

fn bool_value(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn lookup(env: &Env, var: &IterVar) -> Result<i64> {
    env.iter()
        .rev()
        .find(|(name, _)| *name == var.name)
        .map(|(_, v)| *v)
        .ok_or_else(|| TensorizeError::Evaluation(format!("unbound iteration variable `{}`", var.name)))
}

/// Odometer increment over the reduction space; false once it wraps.
fn advance(slots: &mut [(&str, i64)], axes: &[IterVar]) -> bool {
    for (slot, axis) in slots.iter_mut().zip(axes).rev() {
        slot.1 += 1;
        if (slot.1 as usize) < axis.extent {
            return true;
        }
        slot.1 = 0;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dtype::DType;
    use crate::te::expr::{reduce_axis, select, sum};
    use crate::te::tensor::{compute, placeholder};
    use ndarray::Array2;

    #[test]
    fn test_matmul_matches_ndarray() {
        let a = placeholder(&[3, 4], DType::Float64, "A");
        let b = placeholder(&[4, 2], DType::Float64, "B");
        let k = reduce_axis(4, "k");
        let c = compute(&[3, 2], "C", |ax| {
            sum(a.load(vec![ax[0].clone(), k.expr()]) * b.load(vec![k.expr(), ax[1].clone()]), &[k.clone()])
        });

        let a_data = Array2::from_shape_fn((3, 4), |(i, j)| (i * 4 + j) as f64);
        let b_data = Array2::from_shape_fn((4, 2), |(i, j)| (i as f64) - (j as f64));
        let expected = a_data.dot(&b_data).into_dyn();

        let mut eval = Evaluator::new();
        eval.bind(&a, a_data.into_dyn()).unwrap();
        eval.bind(&b, b_data.into_dyn()).unwrap();
        assert_eq!(eval.evaluate(&c).unwrap(), expected);
    }

    #[test]
    fn test_select_guards_out_of_bounds_load() {
        let a = placeholder(&[4], DType::Float32, "A");
        // Shift right by one with zero fill.
        let shifted = compute(&[4], "Shifted", |ax| {
            let i = ax[0].clone();
            select(
                i.clone().ge(Expr::from(1usize)),
                a.load(vec![i - Expr::from(1usize)]),
                Expr::zero(DType::Float32),
            )
        });
        let mut eval = Evaluator::new();
        eval.bind(&a, ndarray::arr1(&[1.0, 2.0, 3.0, 4.0]).into_dyn()).unwrap();
        let out = eval.evaluate(&shifted).unwrap();
        assert_eq!(out.as_slice().unwrap(), &[0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_unbound_placeholder_fails() {
        let a = placeholder(&[2], DType::Float32, "A");
        let twice = compute(&[2], "Twice", |ax| a.load(ax.to_vec()) + a.load(ax.to_vec()));
        let err = Evaluator::new().evaluate(&twice).unwrap_err();
        assert!(matches!(err, TensorizeError::Evaluation(_)));
    }

    #[test]
    fn test_bind_rejects_wrong_shape() {
        let a = placeholder(&[2, 2], DType::Float32, "A");
        let err = Evaluator::new().bind(&a, ArrayD::zeros(IxDyn(&[4]))).unwrap_err();
        assert!(matches!(err, TensorizeError::ShapeMismatch { .. }));
    }
}
