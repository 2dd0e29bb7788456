//! Tensor type: a shared, dtype-erased handle to a host-visible buffer.
//!
//! Clones share storage, so a backend mutating a query tensor in place is
//! observed through every handle. Rows of the second-to-last dimension may be
//! padded: `row_stride` is the element distance between consecutive rows and
//! is at least the width of the last dimension.

use std::sync::Arc;

use half::{bf16, f16};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{DType, Element, Scalar, Shape};
use crate::{Result, RopeError};

/// Typed backing store of a tensor.
#[derive(Clone, Debug, PartialEq)]
pub enum Storage {
    F32(Vec<f32>),
    F64(Vec<f64>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl Storage {
    pub fn dtype(&self) -> DType {
        match self {
            Storage::F32(_) => DType::F32,
            Storage::F64(_) => DType::F64,
            Storage::F16(_) => DType::F16,
            Storage::BF16(_) => DType::BF16,
            Storage::I32(_) => DType::I32,
            Storage::I64(_) => DType::I64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Storage::F32(v) => v.len(),
            Storage::F64(v) => v.len(),
            Storage::F16(v) => v.len(),
            Storage::BF16(v) => v.len(),
            Storage::I32(v) => v.len(),
            Storage::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the elements as `T`, failing if the dtype differs.
    pub fn as_slice<T: Scalar>(&self) -> Result<&[T]> {
        let dtype = self.dtype();
        T::slice(self).ok_or(RopeError::UnsupportedDType {
            what: "typed read",
            dtype,
        })
    }

    /// Mutably borrow the elements as `T`, failing if the dtype differs.
    pub fn as_mut_slice<T: Scalar>(&mut self) -> Result<&mut [T]> {
        let dtype = self.dtype();
        T::slice_mut(self).ok_or(RopeError::UnsupportedDType {
            what: "typed write",
            dtype,
        })
    }
}

/// A tensor handle.
#[derive(Clone)]
pub struct Tensor {
    storage: Arc<RwLock<Storage>>,
    shape: Shape,
    dtype: DType,
    row_stride: usize,
}

impl Tensor {
    // ── Constructors ────────────────────────────────────────────────────

    /// Create a dense tensor; `data.len()` must equal the shape's element count.
    pub fn from_vec<T: Scalar>(data: Vec<T>, shape: &Shape) -> Result<Self> {
        let expected = shape.numel() as usize;
        if data.len() != expected {
            return Err(RopeError::InvalidArgument(format!(
                "data length {} does not match shape {} (expected {})",
                data.len(),
                shape,
                expected,
            )));
        }
        let row_stride = shape.last_dim().max(0) as usize;
        Self::build(T::into_storage(data), shape, row_stride)
    }

    /// Create a tensor whose rows are `row_stride` elements apart.
    pub fn with_row_stride<T: Scalar>(data: Vec<T>, shape: &Shape, row_stride: usize) -> Result<Self> {
        Self::build(T::into_storage(data), shape, row_stride)
    }

    /// Create a dense floating tensor of `dtype` from f32 values.
    pub fn from_f32_as(data: &[f32], shape: &Shape, dtype: DType) -> Result<Self> {
        let expected = shape.numel() as usize;
        if data.len() != expected {
            return Err(RopeError::InvalidArgument(format!(
                "data length {} does not match shape {} (expected {})",
                data.len(),
                shape,
                expected,
            )));
        }
        Self::from_f32_strided(data, shape, shape.last_dim().max(0) as usize, dtype)
    }

    /// Create a row-strided floating tensor of `dtype` from f32 values.
    pub fn from_f32_strided(data: &[f32], shape: &Shape, row_stride: usize, dtype: DType) -> Result<Self> {
        let storage = match dtype {
            DType::F32 => Storage::F32(data.to_vec()),
            DType::F64 => Storage::F64(convert(data)),
            DType::F16 => Storage::F16(convert(data)),
            DType::BF16 => Storage::BF16(convert(data)),
            DType::I32 | DType::I64 => {
                return Err(RopeError::UnsupportedDType {
                    what: "from_f32_strided",
                    dtype,
                });
            }
        };
        Self::build(storage, shape, row_stride)
    }

    fn build(storage: Storage, shape: &Shape, row_stride: usize) -> Result<Self> {
        if shape.0.iter().any(|&d| d < 0) {
            return Err(RopeError::InvalidArgument(format!(
                "negative dimension in shape {shape}"
            )));
        }
        let width = shape.last_dim() as usize;
        if shape.ndim() > 0 && row_stride < width {
            return Err(RopeError::InvalidArgument(format!(
                "row stride {row_stride} is smaller than row width {width}"
            )));
        }
        let rows = shape.rows() as usize;
        let required = if rows == 0 || width == 0 {
            0
        } else {
            (rows - 1) * row_stride + width
        };
        if storage.len() < required {
            return Err(RopeError::InvalidArgument(format!(
                "storage of {} elements cannot hold shape {} with row stride {} (need {})",
                storage.len(),
                shape,
                row_stride,
                required,
            )));
        }
        Ok(Self {
            dtype: storage.dtype(),
            storage: Arc::new(RwLock::new(storage)),
            shape: shape.clone(),
            row_stride,
        })
    }

    // ── Metadata ────────────────────────────────────────────────────────

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Element distance between consecutive rows (`stride(-2)`).
    pub fn row_stride(&self) -> usize {
        self.row_stride
    }

    pub fn numel(&self) -> usize {
        self.shape.numel() as usize
    }

    pub fn is_dense(&self) -> bool {
        self.row_stride == self.shape.last_dim() as usize
    }

    /// Whether two handles share the same storage.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    // ── Access ──────────────────────────────────────────────────────────

    /// Global lock-acquisition rank of this tensor's storage.
    pub(crate) fn lock_rank(&self) -> usize {
        Arc::as_ptr(&self.storage) as usize
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Storage> {
        self.storage.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Storage> {
        self.storage.write()
    }

    /// Run `f` over the raw storage (padding included).
    pub fn with_slice<T: Scalar, R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        let guard = self.storage.read();
        Ok(f(guard.as_slice::<T>()?))
    }

    /// Run `f` over the raw mutable storage (padding included).
    pub fn with_slice_mut<T: Scalar, R>(&self, f: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        let mut guard = self.storage.write();
        Ok(f(guard.as_mut_slice::<T>()?))
    }

    /// Logical elements in row-major order, padding removed.
    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>> {
        let width = self.shape.last_dim() as usize;
        let rows = self.shape.rows() as usize;
        let stride = self.row_stride;
        self.with_slice::<T, _>(|data| {
            if width == 0 || rows == 0 {
                return Vec::new();
            }
            let mut out = Vec::with_capacity(rows * width);
            for r in 0..rows {
                out.extend_from_slice(&data[r * stride..r * stride + width]);
            }
            out
        })
    }

    /// Logical elements converted to f32, for any floating dtype.
    pub fn to_vec_f32(&self) -> Result<Vec<f32>> {
        match self.dtype {
            DType::F32 => self.to_vec::<f32>(),
            DType::F64 => Ok(self.to_vec::<f64>()?.into_iter().map(Element::to_f32).collect()),
            DType::F16 => Ok(self.to_vec::<f16>()?.into_iter().map(Element::to_f32).collect()),
            DType::BF16 => Ok(self.to_vec::<bf16>()?.into_iter().map(Element::to_f32).collect()),
            dtype => Err(RopeError::UnsupportedDType {
                what: "to_vec_f32",
                dtype,
            }),
        }
    }

    /// Integer contents widened to i64 (position ids).
    pub fn to_vec_i64(&self) -> Result<Vec<i64>> {
        match self.dtype {
            DType::I64 => self.to_vec::<i64>(),
            DType::I32 => Ok(self.to_vec::<i32>()?.into_iter().map(i64::from).collect()),
            dtype => Err(RopeError::UnsupportedDType {
                what: "positions",
                dtype,
            }),
        }
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("row_stride", &self.row_stride)
            .finish_non_exhaustive()
    }
}

fn convert<T: Element>(data: &[f32]) -> Vec<T> {
    data.iter().map(|&x| T::from_f32(x)).collect()
}
