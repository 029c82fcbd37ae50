use std::collections::BTreeMap;
use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

use crate::core::dtype::DType;
use crate::te::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IterKind {
    /// Spatial axis; iterations are independent.
    Data,
    /// Reduction axis; iterations accumulate into the same element.
    Reduce,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IterVar {
    pub name: String,
    pub extent: usize,
    pub kind: IterKind,
}

impl IterVar {
    pub fn data(name: &str, extent: usize) -> Self {
        Self { name: name.to_string(), extent, kind: IterKind::Data }
    }

    pub fn reduce(name: &str, extent: usize) -> Self {
        Self { name: name.to_string(), extent, kind: IterKind::Reduce }
    }

    pub fn expr(&self) -> Expr {
        Expr::Var(self.clone())
    }
}

/// Shorthand for a reduction axis, mirroring the usual tensor-expression API.
pub fn reduce_axis(extent: usize, name: &str) -> IterVar {
    IterVar::reduce(name, extent)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Lt,
    Ge,
    And,
}

impl BinOp {
    fn is_predicate(self) -> bool {
        matches!(self, BinOp::Lt | BinOp::Ge | BinOp::And)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64, DType),
    Var(IterVar),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Cast(DType, Box<Expr>),
    Load(Tensor, Vec<Expr>),
    Select(Box<Expr>, Box<Expr>, Box<Expr>),
    Sum(Box<Expr>, Vec<IterVar>),
}

/// Index expression in the form `offset + sum(coef * var)`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Affine {
    pub terms: BTreeMap<String, i64>,
    pub offset: i64,
}

impl Affine {
    pub fn var(name: &str) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(name.to_string(), 1);
        Self { terms, offset: 0 }
    }

    /// Replaces every variable bound in `map` by its affine form.
    pub fn substitute(&self, map: &BTreeMap<String, Affine>) -> Affine {
        let mut out = Affine { terms: BTreeMap::new(), offset: self.offset };
        for (name, &coef) in &self.terms {
            let replacement = match map.get(name) {
                Some(affine) => affine.clone(),
                None => Affine::var(name),
            };
            out = out.merged(replacement.scaled(coef), 1);
        }
        out
    }

    /// Number of consecutive indices covered while each variable ranges over
    /// `[0, extent)`. Variables absent from `extents` are held fixed.
    pub fn span(&self, extents: &BTreeMap<String, usize>) -> usize {
        let reach: i64 = self
            .terms
            .iter()
            .map(|(name, coef)| coef.abs() * (extents.get(name).copied().unwrap_or(1) as i64 - 1))
            .sum();
        reach as usize + 1
    }

    fn scaled(mut self, factor: i64) -> Self {
        for coef in self.terms.values_mut() {
            *coef *= factor;
        }
        self.offset *= factor;
        self
    }

    fn merged(mut self, other: Affine, sign: i64) -> Self {
        for (name, coef) in other.terms {
            *self.terms.entry(name).or_insert(0) += sign * coef;
        }
        self.terms.retain(|_, coef| *coef != 0);
        self.offset += sign * other.offset;
        self
    }
}

pub fn select(cond: Expr, then: Expr, otherwise: Expr) -> Expr {
    Expr::Select(Box::new(cond), Box::new(then), Box::new(otherwise))
}

pub fn sum(body: Expr, axes: &[IterVar]) -> Expr {
    Expr::Sum(Box::new(body), axes.to_vec())
}

impl Expr {
    pub fn cast(self, dtype: DType) -> Expr {
        Expr::Cast(dtype, Box::new(self))
    }

    pub fn lt(self, rhs: Expr) -> Expr {
        Expr::Binary(BinOp::Lt, Box::new(self), Box::new(rhs))
    }

    pub fn ge(self, rhs: Expr) -> Expr {
        Expr::Binary(BinOp::Ge, Box::new(self), Box::new(rhs))
    }

    pub fn and(self, rhs: Expr) -> Expr {
        Expr::Binary(BinOp::And, Box::new(self), Box::new(rhs))
    }

    pub fn zero(dtype: DType) -> Expr {
        Expr::Float(0.0, dtype)
    }

    fn is_index(&self) -> bool {
        matches!(self, Expr::Int(_) | Expr::Var(_))
    }

    /// Result type of the expression.
    pub fn dtype(&self) -> DType {
        match self {
            Expr::Int(_) | Expr::Var(_) => DType::Int32,
            Expr::Float(_, dtype) | Expr::Cast(dtype, _) => *dtype,
            Expr::Binary(op, lhs, rhs) => {
                if op.is_predicate() {
                    DType::Bool
                } else if lhs.is_index() {
                    rhs.dtype()
                } else {
                    lhs.dtype()
                }
            }
            Expr::Load(tensor, _) => tensor.dtype(),
            Expr::Select(_, then, _) => then.dtype(),
            Expr::Sum(body, _) => body.dtype(),
        }
    }

    /// Decomposes an index expression into affine form, if it is affine.
    pub fn affine(&self) -> Option<Affine> {
        match self {
            Expr::Int(v) => Some(Affine { terms: BTreeMap::new(), offset: *v }),
            Expr::Var(var) => Some(Affine::var(&var.name)),
            Expr::Binary(BinOp::Add, lhs, rhs) => Some(lhs.affine()?.merged(rhs.affine()?, 1)),
            Expr::Binary(BinOp::Sub, lhs, rhs) => Some(lhs.affine()?.merged(rhs.affine()?, -1)),
            Expr::Binary(BinOp::Mul, lhs, rhs) => {
                let (l, r) = (lhs.affine()?, rhs.affine()?);
                if l.terms.is_empty() {
                    Some(r.scaled(l.offset))
                } else if r.terms.is_empty() {
                    Some(l.scaled(r.offset))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Every tensor access in the expression, in evaluation order.
    pub fn loads(&self) -> Vec<(&Tensor, &[Expr])> {
        let mut out = Vec::new();
        self.collect_loads(&mut out);
        out
    }

    fn collect_loads<'a>(&'a self, out: &mut Vec<(&'a Tensor, &'a [Expr])>) {
        match self {
            Expr::Int(_) | Expr::Float(..) | Expr::Var(_) => {}
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_loads(out);
                rhs.collect_loads(out);
            }
            Expr::Cast(_, inner) | Expr::Sum(inner, _) => inner.collect_loads(out),
            Expr::Load(tensor, indices) => {
                out.push((tensor, indices.as_slice()));
                for index in indices {
                    index.collect_loads(out);
                }
            }
            Expr::Select(cond, then, otherwise) => {
                cond.collect_loads(out);
                then.collect_loads(out);
                otherwise.collect_loads(out);
            }
        }
    }

    /// Reduction axes of a top-level sum, possibly under a cast; empty otherwise.
    pub fn reduce_axes(&self) -> &[IterVar] {
        match self {
            Expr::Sum(_, axes) => axes,
            Expr::Cast(_, inner) => inner.reduce_axes(),
            _ => &[],
        }
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::Int(v)
    }
}

impl From<usize> for Expr {
    fn from(v: usize) -> Self {
        Expr::Int(v as i64)
    }
}

impl Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::Binary(BinOp::Add, Box::new(self), Box::new(rhs))
    }
}

impl Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::Binary(BinOp::Sub, Box::new(self), Box::new(rhs))
    }
}

impl Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::Binary(BinOp::Mul, Box::new(self), Box::new(rhs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affine_decomposition() {
        let p = IterVar::data("p", 4);
        let rr = IterVar::reduce("rr", 3);
        // p*2 + rr*1 - 1
        let index = p.expr() * Expr::from(2usize) + rr.expr() * Expr::from(1usize) - Expr::from(1i64);
        let affine = index.affine().unwrap();
        assert_eq!(affine.terms.get("p"), Some(&2));
        assert_eq!(affine.terms.get("rr"), Some(&1));
        assert_eq!(affine.offset, -1);
    }

    #[test]
    fn test_non_affine_product() {
        let p = IterVar::data("p", 4);
        let q = IterVar::data("q", 4);
        assert!((p.expr() * q.expr()).affine().is_none());
    }

    #[test]
    fn test_dtype_inference() {
        let x = Expr::Float(1.0, DType::Float16);
        assert_eq!(x.clone().cast(DType::Float32).dtype(), DType::Float32);
        assert_eq!(x.clone().lt(Expr::zero(DType::Float16)).dtype(), DType::Bool);
        assert_eq!((Expr::from(2usize) * x).dtype(), DType::Float16);
    }

    #[test]
    fn test_affine_substitute_and_span() {
        // h = p + rr, with p = 2*pq + 1
        let h = Affine::var("p").merged(Affine::var("rr"), 1);
        let mut map = BTreeMap::new();
        map.insert("p".to_string(), Affine::var("pq").scaled(2).merged(Affine { terms: BTreeMap::new(), offset: 1 }, 1));
        let composed = h.substitute(&map);
        assert_eq!(composed.terms.get("pq"), Some(&2));
        assert_eq!(composed.offset, 1);

        let mut extents = BTreeMap::new();
        extents.insert("pq".to_string(), 3);
        extents.insert("rr".to_string(), 3);
        // 2*(3-1) + 1*(3-1) + 1
        assert_eq!(composed.span(&extents), 7);
    }
}
