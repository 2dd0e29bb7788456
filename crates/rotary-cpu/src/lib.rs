//! Generic parallel host backend.
//!
//! Tokens are the unit of work: every token row of query and key is an
//! independent, non-aliasing chunk, so the rows are split across a rayon pool
//! with `par_chunks_mut` and each unit loops over its heads and pairs.

use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use rotary_core::backend::{Backend, BackendKind, Completion, FloatKernel, RotaryRequest, dispatch_floating};
use rotary_core::kernel::{RotaryStyle, check_rows, cos_sin_row, rotate_token};
use rotary_core::shape::RotaryShape;
use rotary_core::{Element, Result, RopeError};

/// Rotary embedding over a dedicated rayon pool. Work completes before
/// `submit` returns.
pub struct ParallelBackend {
    pool: ThreadPool,
    min_tokens_per_task: usize,
}

impl ParallelBackend {
    /// Create a backend with `threads` workers; 0 picks rayon's default.
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("rotary-cpu-{i}"))
            .build()
            .map_err(|e| RopeError::Device(format!("failed to build thread pool: {e}")))?;
        info!(threads = pool.current_num_threads(), "Initialized parallel rotary backend");
        Ok(Self {
            pool,
            min_tokens_per_task: 1,
        })
    }

    /// Lower bound on tokens handed to one rayon task.
    pub fn with_min_tokens_per_task(mut self, tokens: usize) -> Self {
        self.min_tokens_per_task = tokens.max(1);
        self
    }
}

impl Backend for ParallelBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::GenericParallel
    }

    fn name(&self) -> &str {
        "generic-parallel"
    }

    fn lane_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn submit(&self, request: RotaryRequest) -> Result<Completion> {
        debug!(
            num_tokens = request.shape.num_tokens,
            lanes = self.lane_count(),
            "parallel rotary submission"
        );
        let kernel = RowParallel {
            pool: &self.pool,
            min_len: self.min_tokens_per_task,
        };
        dispatch_floating(&request, &kernel)?;
        Ok(Completion::ready())
    }
}

struct RowParallel<'a> {
    pool: &'a ThreadPool,
    min_len: usize,
}

impl FloatKernel for RowParallel<'_> {
    fn run<T: Element>(&self, request: &RotaryRequest) -> Result<()> {
        request.with_buffers::<T, _>(|query, key, cache| {
            self.pool.install(|| {
                rotate_rows_parallel(
                    &request.positions,
                    query,
                    key,
                    cache,
                    &request.shape,
                    request.style,
                    self.min_len,
                )
            })
        })?
    }
}

/// Rotate every token row in parallel, one work unit per row.
///
/// Must run inside the target pool (`ThreadPool::install`) to use it.
pub fn rotate_rows_parallel<T: Element>(
    positions: &[i64],
    query: &mut [T],
    key: &mut [T],
    cache: &[T],
    shape: &RotaryShape,
    style: RotaryStyle,
    min_len: usize,
) -> Result<()> {
    if positions.len() != shape.num_tokens {
        return Err(RopeError::ShapeMismatch {
            what: "positions length",
            expected: shape.num_tokens.to_string(),
            got: positions.len().to_string(),
        });
    }
    check_rows("query buffer", query.len(), shape.num_tokens, shape.query_width(), shape.query_stride)?;
    check_rows("key buffer", key.len(), shape.num_tokens, shape.key_width(), shape.key_stride)?;
    if shape.num_tokens == 0 {
        return Ok(());
    }
    let rows = positions
        .iter()
        .map(|&p| cos_sin_row(cache, shape.rot_dim, p))
        .collect::<Result<Vec<_>>>()?;

    let query_width = shape.query_width();
    let key_width = shape.key_width();
    query
        .par_chunks_mut(shape.query_stride)
        .zip(key.par_chunks_mut(shape.key_stride))
        .zip(rows.par_iter())
        .with_min_len(min_len)
        .for_each(|((q, k), cs)| {
            rotate_token(&mut q[..query_width], &mut k[..key_width], cs, shape, style);
        });
    Ok(())
}

/// Create a shared parallel backend with rayon's default thread count.
pub fn parallel_backend() -> Result<Arc<ParallelBackend>> {
    Ok(Arc::new(ParallelBackend::new(0)?))
}
