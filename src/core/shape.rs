use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TensorizeError};

const DELIMITER: char = 'x';

/// Problem dimensions of one convolution capsule problem.
///
/// `(K, P, Q, C, R, S)` = output channels, output height, output width,
/// input channels, kernel height, kernel width. Canonical text form is the six
/// values joined by `x`, e.g. `16x4x4x16x1x1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeKey {
    pub k: usize,
    pub p: usize,
    pub q: usize,
    pub c: usize,
    pub r: usize,
    pub s: usize,
}

impl ShapeKey {
    pub fn new(k: usize, p: usize, q: usize, c: usize, r: usize, s: usize) -> Result<Self> {
        let key = Self { k, p, q, c, r, s };
        if key.as_array().iter().any(|&v| v == 0) {
            return Err(TensorizeError::MalformedShapeKey {
                key: key.to_string(),
                reason: "every dimension must be positive".to_string(),
            });
        }
        Ok(key)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let malformed = |reason: String| TensorizeError::MalformedShapeKey {
            key: text.to_string(),
            reason,
        };

        let fields: Vec<&str> = text.split(DELIMITER).collect();
        if fields.len() != 6 {
            return Err(malformed(format!("expected 6 dimensions, found {}", fields.len())));
        }

        let mut dims = [0usize; 6];
        for (slot, field) in dims.iter_mut().zip(&fields) {
            if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed(format!("`{}` is not a decimal integer", field)));
            }
            if field.len() > 1 && field.starts_with('0') {
                return Err(malformed(format!("`{}` has a leading zero", field)));
            }
            *slot = field
                .parse::<usize>()
                .map_err(|_| malformed(format!("`{}` does not fit a dimension", field)))?;
            if *slot == 0 {
                return Err(malformed("every dimension must be positive".to_string()));
            }
        }
        let [k, p, q, c, r, s] = dims;
        Ok(Self { k, p, q, c, r, s })
    }

    pub fn as_array(&self) -> [usize; 6] {
        [self.k, self.p, self.q, self.c, self.r, self.s]
    }

    /// Image operand, channel-major: `[C, P, Q]`.
    pub fn a_shape(&self) -> Vec<usize> {
        vec![self.c, self.p, self.q]
    }

    /// Filter operand for one kernel tap: `[K, C]`.
    pub fn b_shape(&self) -> Vec<usize> {
        vec![self.k, self.c]
    }

    /// Output: `[K, P, Q]`.
    pub fn c_shape(&self) -> Vec<usize> {
        vec![self.k, self.p, self.q]
    }
}

impl fmt::Display for ShapeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}x{}x{}x{}",
            self.k, self.p, self.q, self.c, self.r, self.s
        )
    }
}

impl FromStr for ShapeKey {
    type Err = TensorizeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference_key() {
        let key = ShapeKey::parse("16x4x4x16x1x1").unwrap();
        assert_eq!(key.as_array(), [16, 4, 4, 16, 1, 1]);
        assert_eq!(key.a_shape(), vec![16, 4, 4]);
        assert_eq!(key.b_shape(), vec![16, 16]);
        assert_eq!(key.c_shape(), vec![16, 4, 4]);
        assert_eq!(key.to_string(), "16x4x4x16x1x1");
    }

    #[test]
    fn test_rejects_wrong_arity() {
        let err = ShapeKey::parse("16x4x4x16x1").unwrap_err();
        assert!(matches!(err, TensorizeError::MalformedShapeKey { .. }));
        assert!(ShapeKey::parse("16x4x4x16x1x1x1").is_err());
    }

    #[test]
    fn test_rejects_zero_and_garbage() {
        assert!(ShapeKey::parse("16x0x4x16x1x1").is_err());
        assert!(ShapeKey::parse("16x-4x4x16x1x1").is_err());
        assert!(ShapeKey::parse("").is_err());
        assert!(ShapeKey::new(1, 1, 1, 0, 1, 1).is_err());
        let err = ShapeKey::parse("016x4x4x16x1x1").unwrap_err();
        assert!(matches!(err, TensorizeError::MalformedShapeKey { reason, .. } if reason.contains("leading zero")));
        assert!(ShapeKey::parse("16x4x4x16x1x00").is_err());
    }
}
