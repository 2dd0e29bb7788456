//! Device contract for queued rotary work and the host lane device.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use rotary_core::backend::{FloatKernel, RotaryRequest, dispatch_floating};
use rotary_core::kernel::{check_rows, cos_sin_row, rotate_token};
use rotary_core::shape::MAX_WORK_GROUP;
use rotary_core::{Element, Result, RopeError};

/// A device that executes one validated command at a time.
///
/// `execute` runs on the queue's worker thread. An `Err` is a fault of that
/// command only; the queue keeps running.
pub trait QueueDevice: Send + Sync {
    fn name(&self) -> &str;

    fn lane_count(&self) -> usize;

    fn execute(&self, request: &RotaryRequest) -> Result<()>;
}

/// Emulated vendor device with a fixed number of lanes.
///
/// Tokens are split into `lane_count` contiguous blocks, one block per lane.
pub struct HostLaneDevice {
    pool: ThreadPool,
    lanes: usize,
}

impl HostLaneDevice {
    pub fn new(lanes: usize) -> Result<Self> {
        let lanes = lanes.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(lanes)
            .thread_name(|i| format!("rotary-lane-{i}"))
            .build()
            .map_err(|e| RopeError::Device(format!("failed to start device lanes: {e}")))?;
        info!(lanes, "Initialized host lane device");
        Ok(Self { pool, lanes })
    }

    /// One lane per available CPU.
    pub fn with_default_lanes() -> Result<Self> {
        let lanes = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self::new(lanes)
    }
}

impl QueueDevice for HostLaneDevice {
    fn name(&self) -> &str {
        "host-lanes"
    }

    fn lane_count(&self) -> usize {
        self.lanes
    }

    fn execute(&self, request: &RotaryRequest) -> Result<()> {
        debug!(
            num_tokens = request.shape.num_tokens,
            lanes = self.lanes,
            work_group = request.shape.work_group_size(MAX_WORK_GROUP),
            "host lane launch"
        );
        dispatch_floating(request, &LaneKernel {
            pool: &self.pool,
            lanes: self.lanes,
        })
    }
}

struct LaneKernel<'a> {
    pool: &'a ThreadPool,
    lanes: usize,
}

impl FloatKernel for LaneKernel<'_> {
    fn run<T: Element>(&self, request: &RotaryRequest) -> Result<()> {
        request.with_buffers::<T, _>(|query, key, cache| self.launch(request, query, key, cache))?
    }
}

impl LaneKernel<'_> {
    fn launch<T: Element>(
        &self,
        request: &RotaryRequest,
        query: &mut [T],
        key: &mut [T],
        cache: &[T],
    ) -> Result<()> {
        let shape = &request.shape;
        check_rows("query buffer", query.len(), shape.num_tokens, shape.query_width(), shape.query_stride)?;
        check_rows("key buffer", key.len(), shape.num_tokens, shape.key_width(), shape.key_stride)?;
        if shape.num_tokens == 0 {
            return Ok(());
        }
        let rows = request
            .positions
            .iter()
            .map(|&p| cos_sin_row(cache, shape.rot_dim, p))
            .collect::<Result<Vec<_>>>()?;

        let per_lane = shape.num_tokens.div_ceil(self.lanes);
        let (query_width, key_width) = (shape.query_width(), shape.key_width());
        let (query_stride, key_stride) = (shape.query_stride, shape.key_stride);
        self.pool.install(|| {
            query
                .par_chunks_mut(per_lane * query_stride)
                .zip(key.par_chunks_mut(per_lane * key_stride))
                .zip(rows.par_chunks(per_lane))
                .for_each(|((q_block, k_block), cs_block)| {
                    for (t, cs) in cs_block.iter().enumerate() {
                        let q = &mut q_block[t * query_stride..t * query_stride + query_width];
                        let k = &mut k_block[t * key_stride..t * key_stride + key_width];
                        rotate_token(q, k, cs, shape, request.style);
                    }
                });
        });
        Ok(())
    }
}
