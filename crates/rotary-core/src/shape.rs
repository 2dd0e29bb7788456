//! Shape/stride resolution for one rotary embedding call.
//!
//! The resolver derives the per-call problem size from tensor metadata and
//! rejects every layout the kernel cannot index safely. It runs before any
//! buffer is touched.

use crate::types::Shape;
use crate::{Result, RopeError};

/// Largest work group a single token is split into.
pub const MAX_WORK_GROUP: usize = 512;

/// Per-call problem size. Derived fresh for every call and never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RotaryShape {
    pub num_tokens: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    /// Must be even and `<= head_size`.
    pub rot_dim: usize,
    pub head_size: usize,
    pub query_stride: usize,
    pub key_stride: usize,
}

impl RotaryShape {
    /// Resolve from the shapes and row strides of the call's tensors.
    ///
    /// `query`/`key` are `[num_tokens, heads * head_size]` or
    /// `[batch, seq, heads * head_size]`; `cache` is `[max_position, rot_dim]`.
    pub fn resolve(
        positions: &Shape,
        query: (&Shape, usize),
        key: (&Shape, usize),
        cache: &Shape,
        head_size: i64,
    ) -> Result<Self> {
        let (query_shape, query_stride) = query;
        let (key_shape, key_stride) = key;

        if head_size <= 0 {
            return Err(RopeError::InvalidArgument(format!(
                "head_size must be positive, got {head_size}"
            )));
        }
        if query_shape.ndim() < 2 {
            return Err(RopeError::ShapeMismatch {
                what: "query rank",
                expected: ">= 2".into(),
                got: query_shape.to_string(),
            });
        }
        if key_shape.ndim() < 2 {
            return Err(RopeError::ShapeMismatch {
                what: "key rank",
                expected: ">= 2".into(),
                got: key_shape.to_string(),
            });
        }

        let query_width = query_shape.last_dim();
        let key_width = key_shape.last_dim();
        if query_width <= 0 {
            return Err(RopeError::ShapeMismatch {
                what: "query last dim",
                expected: "a positive width".into(),
                got: query_width.to_string(),
            });
        }
        if key_width <= 0 {
            return Err(RopeError::ShapeMismatch {
                what: "key last dim",
                expected: "a positive width".into(),
                got: key_width.to_string(),
            });
        }
        if query_width % head_size != 0 {
            return Err(RopeError::ShapeMismatch {
                what: "query last dim",
                expected: format!("a multiple of head_size {head_size}"),
                got: query_width.to_string(),
            });
        }
        if key_width % head_size != 0 {
            return Err(RopeError::ShapeMismatch {
                what: "key last dim",
                expected: format!("a multiple of head_size {head_size}"),
                got: key_width.to_string(),
            });
        }

        let num_tokens = query_shape.rows();
        let key_tokens = key_shape.rows();
        if key_tokens != num_tokens {
            return Err(RopeError::ShapeMismatch {
                what: "key token count",
                expected: num_tokens.to_string(),
                got: key_tokens.to_string(),
            });
        }
        if positions.numel() != num_tokens {
            return Err(RopeError::ShapeMismatch {
                what: "positions length",
                expected: num_tokens.to_string(),
                got: positions.numel().to_string(),
            });
        }

        if cache.ndim() != 2 {
            return Err(RopeError::ShapeMismatch {
                what: "cos_sin_cache rank",
                expected: "2 ([max_position, rot_dim])".into(),
                got: cache.to_string(),
            });
        }
        let rot_dim = cache.0[1];
        if rot_dim <= 0 || rot_dim % 2 != 0 {
            return Err(RopeError::ShapeMismatch {
                what: "rot_dim",
                expected: "a positive even number".into(),
                got: rot_dim.to_string(),
            });
        }
        if rot_dim > head_size {
            return Err(RopeError::ShapeMismatch {
                what: "rot_dim",
                expected: format!("<= head_size {head_size}"),
                got: rot_dim.to_string(),
            });
        }

        Ok(Self {
            num_tokens: num_tokens as usize,
            num_heads: (query_width / head_size) as usize,
            num_kv_heads: (key_width / head_size) as usize,
            rot_dim: rot_dim as usize,
            head_size: head_size as usize,
            query_stride,
            key_stride,
        })
    }

    /// Number of rotation pairs per head.
    pub fn embed_dim(&self) -> usize {
        self.rot_dim / 2
    }

    /// Rotation pairs across all query heads of one token.
    pub fn query_pairs(&self) -> usize {
        self.num_heads * self.embed_dim()
    }

    /// Lanes one token's work is spread over, capped at `max`.
    pub fn work_group_size(&self, max: usize) -> usize {
        self.query_pairs().min(max).max(1)
    }

    pub fn query_width(&self) -> usize {
        self.num_heads * self.head_size
    }

    pub fn key_width(&self) -> usize {
        self.num_kv_heads * self.head_size
    }
}
