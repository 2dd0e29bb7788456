//! Core type definitions: DType, Shape, element traits.

use std::ops::{Add, Mul, Sub};
use std::str::FromStr;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::RopeError;
use crate::tensor::Storage;

/// Supported data types for tensor elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F64,
    F16,
    BF16,
    I32,
    I64,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64 | DType::F16 | DType::BF16)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DType::I32 | DType::I64)
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F64 => write!(f, "f64"),
            DType::F16 => write!(f, "f16"),
            DType::BF16 => write!(f, "bf16"),
            DType::I32 => write!(f, "i32"),
            DType::I64 => write!(f, "i64"),
        }
    }
}

impl FromStr for DType {
    type Err = RopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float32" => Ok(DType::F32),
            "f64" | "float64" => Ok(DType::F64),
            "f16" | "float16" | "half" => Ok(DType::F16),
            "bf16" | "bfloat16" => Ok(DType::BF16),
            "i32" | "int32" => Ok(DType::I32),
            "i64" | "int64" => Ok(DType::I64),
            other => Err(RopeError::InvalidArgument(format!("unknown dtype {other:?}"))),
        }
    }
}

/// Tensor shape (dimensions).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape(pub SmallVec<[i64; 4]>);

impl Shape {
    pub fn new(dims: impl AsRef<[i64]>) -> Self {
        Self(SmallVec::from_slice(dims.as_ref()))
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements.
    pub fn numel(&self) -> i64 {
        self.0.iter().product()
    }

    /// Get dimension at axis (supports negative indexing).
    pub fn dim(&self, axis: i32) -> Option<i64> {
        let ndim = self.0.len() as i32;
        let idx = if axis < 0 { ndim + axis } else { axis };
        if idx >= 0 && idx < ndim {
            Some(self.0[idx as usize])
        } else {
            None
        }
    }

    /// Width of the innermost dimension, 1 for scalars.
    pub fn last_dim(&self) -> i64 {
        self.dim(-1).unwrap_or(1)
    }

    /// Product of every dimension except the last.
    pub fn rows(&self) -> i64 {
        match self.0.split_last() {
            Some((_, leading)) => leading.iter().product(),
            None => 1,
        }
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// A type that can live in tensor storage.
pub trait Scalar: Copy + Send + Sync + std::fmt::Debug + 'static {
    const DTYPE: DType;

    #[doc(hidden)]
    fn into_storage(data: Vec<Self>) -> Storage;
    #[doc(hidden)]
    fn slice(storage: &Storage) -> Option<&[Self]>;
    #[doc(hidden)]
    fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]>;
}

/// Floating-point element the rotary transform runs on.
///
/// Arithmetic happens in the element's own precision; `f16`/`bf16` round after
/// every operation.
pub trait Element:
    Scalar + PartialEq + Add<Output = Self> + Sub<Output = Self> + Mul<Output = Self>
{
    fn from_f32(v: f32) -> Self;
    fn to_f32(self) -> f32;
}

macro_rules! impl_scalar {
    ($ty:ty, $variant:ident) => {
        impl Scalar for $ty {
            const DTYPE: DType = DType::$variant;

            fn into_storage(data: Vec<Self>) -> Storage {
                Storage::$variant(data)
            }

            fn slice(storage: &Storage) -> Option<&[Self]> {
                match storage {
                    Storage::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]> {
                match storage {
                    Storage::$variant(v) => Some(v.as_mut_slice()),
                    _ => None,
                }
            }
        }
    };
}

impl_scalar!(f32, F32);
impl_scalar!(f64, F64);
impl_scalar!(f16, F16);
impl_scalar!(bf16, BF16);
impl_scalar!(i32, I32);
impl_scalar!(i64, I64);

impl Element for f32 {
    fn from_f32(v: f32) -> Self {
        v
    }
    fn to_f32(self) -> f32 {
        self
    }
}

impl Element for f64 {
    fn from_f32(v: f32) -> Self {
        v as f64
    }
    fn to_f32(self) -> f32 {
        self as f32
    }
}

impl Element for f16 {
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
}

impl Element for bf16 {
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_numel_and_rows() {
        assert_eq!(Shape::new([2, 3, 4]).numel(), 24);
        assert_eq!(Shape::new([2, 3, 4]).rows(), 6);
        assert_eq!(Shape::new(Vec::<i64>::new()).numel(), 1);
        assert_eq!(Shape::new([0, 5]).numel(), 0);
        assert_eq!(Shape::new([0, 5]).rows(), 0);
    }

    #[test]
    fn test_shape_dim_negative_index() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.dim(0), Some(2));
        assert_eq!(s.dim(-1), Some(4));
        assert_eq!(s.dim(-3), Some(2));
        assert_eq!(s.dim(3), None);
        assert_eq!(s.last_dim(), 4);
    }

    #[test]
    fn test_shape_display() {
        assert_eq!(Shape::new([7, 64]).to_string(), "[7, 64]");
    }

    #[test]
    fn test_dtype_class() {
        assert!(DType::F16.is_float());
        assert!(!DType::I64.is_float());
        assert!(DType::I32.is_integer());
    }

    #[test]
    fn test_dtype_parse() {
        assert_eq!("F16".parse::<DType>().unwrap(), DType::F16);
        assert_eq!("bfloat16".parse::<DType>().unwrap(), DType::BF16);
        assert!("q4".parse::<DType>().is_err());
    }

    #[test]
    fn test_half_arithmetic_stays_in_precision() {
        let a = f16::from_f32(1.0);
        let b = f16::from_f32(0.5);
        assert_eq!((a * b + b).to_f32(), 1.0);
        assert_eq!(<bf16 as Element>::from_f32(2.0).to_f32(), 2.0);
    }
}
