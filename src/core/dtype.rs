use std::fmt;
use std::str::FromStr;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TensorizeError};

/// Element types a tensor-core capsule can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float16,
    BFloat16,
    Float32,
    Float64,
    Int4,
    Int8,
    Int32,
    Bool,
}

impl DType {
    pub fn bits(self) -> u32 {
        match self {
            Self::Bool => 1,
            Self::Int4 => 4,
            Self::Int8 => 8,
            Self::Float16 | Self::BFloat16 => 16,
            Self::Float32 | Self::Int32 => 32,
            Self::Float64 => 64,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::Float16 | Self::BFloat16 | Self::Float32 | Self::Float64)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Float16 => "float16",
            Self::BFloat16 => "bfloat16",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Int4 => "int4",
            Self::Int8 => "int8",
            Self::Int32 => "int32",
            Self::Bool => "bool",
        }
    }

    /// Accumulator type the matrix unit uses for products of this type.
    pub fn accumulator(self) -> DType {
        match self {
            Self::Float16 | Self::BFloat16 | Self::Float32 => Self::Float32,
            Self::Float64 => Self::Float64,
            Self::Int4 | Self::Int8 | Self::Int32 | Self::Bool => Self::Int32,
        }
    }

    /// Checks that `accumulator` can hold products of `self` without narrowing.
    pub fn check_accumulator(self, accumulator: DType, capsule: &str) -> Result<()> {
        let required = self.accumulator();
        if accumulator.is_float() != required.is_float() || accumulator.bits() < required.bits() {
            return Err(TensorizeError::NarrowingAccumulator {
                capsule: capsule.to_string(),
                input: self,
                accumulator,
                required,
            });
        }
        Ok(())
    }

    /// Rounds `value` to the nearest value representable in this type.
    ///
    /// Integer types wrap the way a device register does.
    pub fn round(self, value: f64) -> f64 {
        match self {
            Self::Float16 => f16::from_f64(value).to_f64(),
            Self::BFloat16 => bf16::from_f64(value).to_f64(),
            Self::Float32 => value as f32 as f64,
            Self::Float64 => value,
            Self::Int32 => (value as i64) as i32 as f64,
            Self::Int8 => (value as i64) as i8 as f64,
            Self::Int4 => {
                let wrapped = (value as i64).rem_euclid(16);
                (if wrapped >= 8 { wrapped - 16 } else { wrapped }) as f64
            }
            Self::Bool => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = TensorizeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "float16" | "half" => Ok(Self::Float16),
            "bfloat16" => Ok(Self::BFloat16),
            "float32" | "float" => Ok(Self::Float32),
            "float64" | "double" => Ok(Self::Float64),
            "int4" => Ok(Self::Int4),
            "int8" => Ok(Self::Int8),
            "int32" => Ok(Self::Int32),
            "bool" | "int1" => Ok(Self::Bool),
            other => Err(TensorizeError::UnsupportedDtype(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_accumulates_in_single() {
        assert_eq!(DType::Float16.accumulator(), DType::Float32);
        assert!(DType::Float16.check_accumulator(DType::Float32, "mma").is_ok());
        assert!(DType::Float16.check_accumulator(DType::Float64, "mma").is_ok());
    }

    #[test]
    fn test_narrowing_is_rejected() {
        let err = DType::Float16.check_accumulator(DType::Float16, "mma").unwrap_err();
        assert!(matches!(err, TensorizeError::NarrowingAccumulator { required: DType::Float32, .. }));

        // Integer products never accumulate in a float register.
        assert!(DType::Int8.check_accumulator(DType::Float32, "mma").is_err());
    }

    #[test]
    fn test_rounding() {
        assert_eq!(DType::Float16.round(1.0 + 1e-4), 1.0);
        assert_eq!(DType::Int8.round(130.0), -126.0);
        assert_eq!(DType::Int4.round(9.0), -7.0);
        assert_eq!(DType::Bool.round(-3.0), 1.0);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("float16".parse::<DType>().unwrap(), DType::Float16);
        assert_eq!(DType::Int4.to_string(), "int4");
        assert!("complex64".parse::<DType>().is_err());
    }
}
