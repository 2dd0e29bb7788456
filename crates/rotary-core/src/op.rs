//! The `rotary_embedding` operator: validation, shape resolution, dispatch.

use std::sync::Arc;

use tracing::debug;

use crate::backend::{Backend, Completion, RotaryRequest};
use crate::config::RopeConfig;
use crate::kernel::RotaryStyle;
use crate::shape::RotaryShape;
use crate::tensor::Tensor;
use crate::{Result, RopeError};

/// Apply GPT-NeoX (`is_neox`) or GPT-J style rotary embedding to `query` and
/// `key` in place.
///
/// - `positions`: `[num_tokens]` or `[batch, seq]`, integer
/// - `query`: `[.., num_tokens, num_heads * head_size]`
/// - `key`: `[.., num_tokens, num_kv_heads * head_size]`
/// - `cos_sin_cache`: `[max_position, rot_dim]`, same dtype as query/key
///
/// Every precondition is checked before the backend sees the request; a
/// rejected call leaves all buffers untouched. The returned completion must be
/// waited on before reading query/key.
pub fn rotary_embedding(
    backend: &dyn Backend,
    positions: &Tensor,
    query: &Tensor,
    key: &Tensor,
    head_size: i64,
    cos_sin_cache: &Tensor,
    is_neox: bool,
) -> Result<Completion> {
    let request = prepare(positions, query, key, head_size, cos_sin_cache, is_neox)?;
    if request.shape.num_tokens == 0 {
        return Ok(Completion::ready());
    }
    debug!(
        backend = backend.name(),
        num_tokens = request.shape.num_tokens,
        num_heads = request.shape.num_heads,
        num_kv_heads = request.shape.num_kv_heads,
        rot_dim = request.shape.rot_dim,
        head_size = request.shape.head_size,
        style = %request.style,
        dtype = %request.dtype(),
        "submitting rotary_embedding"
    );
    backend.submit(request)
}

/// [`rotary_embedding`] followed by waiting for completion.
pub fn rotary_embedding_sync(
    backend: &dyn Backend,
    positions: &Tensor,
    query: &Tensor,
    key: &Tensor,
    head_size: i64,
    cos_sin_cache: &Tensor,
    is_neox: bool,
) -> Result<()> {
    rotary_embedding(backend, positions, query, key, head_size, cos_sin_cache, is_neox)?.wait()
}

/// Validate the call and build the request handed to a backend.
pub fn prepare(
    positions: &Tensor,
    query: &Tensor,
    key: &Tensor,
    head_size: i64,
    cos_sin_cache: &Tensor,
    is_neox: bool,
) -> Result<RotaryRequest> {
    let dtype = query.dtype();
    if !dtype.is_float() {
        return Err(RopeError::UnsupportedDType {
            what: "query",
            dtype,
        });
    }
    for (what, t) in [("key", key), ("cos_sin_cache", cos_sin_cache)] {
        if t.dtype() != dtype {
            return Err(RopeError::UnsupportedDType {
                what,
                dtype: t.dtype(),
            });
        }
    }
    if !positions.dtype().is_integer() {
        return Err(RopeError::UnsupportedDType {
            what: "positions",
            dtype: positions.dtype(),
        });
    }
    if !positions.is_dense() {
        return Err(RopeError::InvalidArgument("positions must be contiguous".into()));
    }
    if !cos_sin_cache.is_dense() {
        return Err(RopeError::InvalidArgument("cos_sin_cache must be contiguous".into()));
    }
    if query.shares_storage(key)
        || query.shares_storage(cos_sin_cache)
        || key.shares_storage(cos_sin_cache)
    {
        return Err(RopeError::InvalidArgument(
            "query, key and cos_sin_cache must not share storage".into(),
        ));
    }

    let shape = RotaryShape::resolve(
        positions.shape(),
        (query.shape(), query.row_stride()),
        (key.shape(), key.row_stride()),
        cos_sin_cache.shape(),
        head_size,
    )?;

    let max_position = cos_sin_cache.shape().0[0];
    let ids = positions.to_vec_i64()?;
    if let Some((t, &p)) = ids
        .iter()
        .enumerate()
        .find(|&(_, &p)| p < 0 || p >= max_position)
    {
        return Err(RopeError::InvalidArgument(format!(
            "position {p} of token {t} out of range for cache of {max_position} positions"
        )));
    }

    Ok(RotaryRequest {
        shape,
        positions: Arc::from(ids),
        query: query.clone(),
        key: key.clone(),
        cache: cos_sin_cache.clone(),
        style: RotaryStyle::from_is_neox(is_neox),
    })
}

/// A rotary embedding layer: configuration plus its prebuilt cos/sin cache.
#[derive(Clone, Debug)]
pub struct RotaryEmbedding {
    head_size: usize,
    rot_dim: usize,
    max_position: usize,
    style: RotaryStyle,
    cache: Tensor,
}

impl RotaryEmbedding {
    pub fn new(config: &RopeConfig) -> Result<Self> {
        config.validate()?;
        let cache = config.cache_builder().build_dtype(config.dtype)?;
        Ok(Self {
            head_size: config.head_size,
            rot_dim: config.rot_dim(),
            max_position: config.max_position_embeddings,
            style: config.style(),
            cache,
        })
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn rot_dim(&self) -> usize {
        self.rot_dim
    }

    pub fn max_position(&self) -> usize {
        self.max_position
    }

    pub fn style(&self) -> RotaryStyle {
        self.style
    }

    pub fn cos_sin_cache(&self) -> &Tensor {
        &self.cache
    }

    /// Rotate `query` and `key` in place for the given positions.
    pub fn forward(
        &self,
        backend: &dyn Backend,
        positions: &Tensor,
        query: &Tensor,
        key: &Tensor,
    ) -> Result<Completion> {
        rotary_embedding(
            backend,
            positions,
            query,
            key,
            self.head_size as i64,
            &self.cache,
            self.style.is_neox(),
        )
    }
}
