use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::dtype::DType;
use crate::te::expr::{Expr, IterVar};

#[derive(Debug, Clone, PartialEq)]
pub enum TensorOp {
    Placeholder,
    Compute { axes: Vec<IterVar>, body: Expr },
}

#[derive(Debug, PartialEq)]
pub struct TensorNode {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub op: TensorOp,
}

/// A shared, immutable tensor expression node.
///
/// Equality is structural: two tensors built independently from the same
/// inputs by the same builder compare equal.
#[derive(Clone)]
pub struct Tensor(Arc<TensorNode>);

/// Name, shape and dtype of a tensor, as handed to the lowering backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDesc {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

pub fn placeholder(shape: &[usize], dtype: DType, name: &str) -> Tensor {
    Tensor(Arc::new(TensorNode {
        name: name.to_string(),
        shape: shape.to_vec(),
        dtype,
        op: TensorOp::Placeholder,
    }))
}

/// Builds a compute tensor with axis names `ax0, ax1, ...`.
pub fn compute<F>(shape: &[usize], name: &str, f: F) -> Tensor
where
    F: FnOnce(&[Expr]) -> Expr,
{
    let names: Vec<String> = (0..shape.len()).map(|i| format!("ax{}", i)).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    compute_named(shape, &names, name, f)
}

pub fn compute_named<F>(shape: &[usize], axis_names: &[&str], name: &str, f: F) -> Tensor
where
    F: FnOnce(&[Expr]) -> Expr,
{
    assert_eq!(shape.len(), axis_names.len(), "one axis name per dimension");
    let axes: Vec<IterVar> = shape
        .iter()
        .zip(axis_names)
        .map(|(&extent, axis)| IterVar::data(axis, extent))
        .collect();
    let vars: Vec<Expr> = axes.iter().map(IterVar::expr).collect();
    let body = f(&vars);
    Tensor(Arc::new(TensorNode {
        name: name.to_string(),
        shape: shape.to_vec(),
        dtype: body.dtype(),
        op: TensorOp::Compute { axes, body },
    }))
}

impl Tensor {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.0.shape
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    pub fn op(&self) -> &TensorOp {
        &self.0.op
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.0.op, TensorOp::Placeholder)
    }

    pub fn num_elements(&self) -> usize {
        self.0.shape.iter().product()
    }

    pub fn load(&self, indices: Vec<Expr>) -> Expr {
        Expr::Load(self.clone(), indices)
    }

    pub fn axes(&self) -> &[IterVar] {
        match &self.0.op {
            TensorOp::Placeholder => &[],
            TensorOp::Compute { axes, .. } => axes,
        }
    }

    pub fn body(&self) -> Option<&Expr> {
        match &self.0.op {
            TensorOp::Placeholder => None,
            TensorOp::Compute { body, .. } => Some(body),
        }
    }

    pub fn reduce_axes(&self) -> &[IterVar] {
        self.body().map(Expr::reduce_axes).unwrap_or(&[])
    }

    /// Distinct tensors read by this tensor's body, in order of first access.
    pub fn input_tensors(&self) -> Vec<Tensor> {
        let mut inputs: Vec<Tensor> = Vec::new();
        if let Some(body) = self.body() {
            for (tensor, _) in body.loads() {
                if !inputs.iter().any(|t| t.same_as(tensor)) {
                    inputs.push(tensor.clone());
                }
            }
        }
        inputs
    }

    /// Identity comparison, as opposed to structural `==`.
    pub fn same_as(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn node_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn desc(&self) -> TensorDesc {
        TensorDesc {
            name: self.name().to_string(),
            shape: self.shape().to_vec(),
            dtype: self.dtype(),
        }
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other) || *self.0 == *other.0
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({}: {:?} {})", self.0.name, self.0.shape, self.0.dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::te::expr::{reduce_axis, sum};

    fn matmul(a: &Tensor, b: &Tensor) -> Tensor {
        let k = reduce_axis(a.shape()[1], "k");
        compute(&[a.shape()[0], b.shape()[1]], "C", |ax| {
            sum(
                a.load(vec![ax[0].clone(), k.expr()]) * b.load(vec![k.expr(), ax[1].clone()]),
                &[k.clone()],
            )
        })
    }

    #[test]
    fn test_structural_equality() {
        let a = placeholder(&[4, 8], DType::Float16, "A");
        let b = placeholder(&[8, 2], DType::Float16, "B");
        let c1 = matmul(&a, &b);
        let c2 = matmul(&a, &b);
        assert!(!c1.same_as(&c2));
        assert_eq!(c1, c2);
        assert_eq!(c1.shape(), &[4, 2]);
        assert_eq!(c1.reduce_axes().len(), 1);
    }

    #[test]
    fn test_input_tensors_are_deduplicated() {
        let a = placeholder(&[4, 4], DType::Float32, "A");
        let sq = compute(&[4, 4], "Sq", |ax| {
            a.load(ax.to_vec()) * a.load(ax.to_vec())
        });
        let inputs = sq.input_tensors();
        assert_eq!(inputs.len(), 1);
        assert!(inputs[0].same_as(&a));
    }
}
