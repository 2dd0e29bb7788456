//! Metal device for the command queue (f32 only).

use std::collections::HashMap;

use metal::{
    Buffer, CompileOptions, ComputePipelineState, Device, MTLCommandBufferStatus, MTLResourceOptions,
    MTLSize,
};
use parking_lot::Mutex;
use tracing::info;

use rotary_core::shape::MAX_WORK_GROUP;
use rotary_core::{DType, Result, RopeError, RotaryRequest};

use crate::device::QueueDevice;

const ROTARY_F32: &str = "rotary_embedding_f32";

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct RotaryParams {
    num_heads: u32,
    num_kv_heads: u32,
    head_size: u32,
    rot_dim: u32,
    query_stride: u32,
    key_stride: u32,
    is_neox: u32,
}

pub struct MetalDevice {
    device: Device,
    queue: metal::CommandQueue,
    name: String,
    pipelines: Mutex<HashMap<&'static str, ComputePipelineState>>,
}

// SAFETY: metal::Device and metal::CommandQueue are Objective-C ref-counted
// wrappers whose retain/release are atomic. Metal command queues are
// documented as thread-safe, and the device calls used here (buffer and
// pipeline creation) may be made from any thread. The pipeline map is guarded
// by a mutex.
unsafe impl Send for MetalDevice {}
unsafe impl Sync for MetalDevice {}

impl MetalDevice {
    pub fn new() -> Result<Self> {
        let device = Device::system_default().ok_or(RopeError::BackendUnavailable("no Metal device"))?;
        let queue = device.new_command_queue();
        let name = device.name().to_string();
        info!(device = %name, "Initialized Metal device");
        Ok(Self {
            device,
            queue,
            name,
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    fn pipeline(&self, key: &'static str) -> Result<ComputePipelineState> {
        let mut cache = self.pipelines.lock();
        if let Some(pipeline) = cache.get(key) {
            return Ok(pipeline.to_owned());
        }
        let library = self
            .device
            .new_library_with_source(include_str!("kernels/rotary_embedding.metal"), &CompileOptions::new())
            .map_err(|e| RopeError::Device(format!("failed to compile Metal library: {e}")))?;
        let function = library
            .get_function(key, None)
            .map_err(|e| RopeError::Device(format!("failed to get function {key}: {e}")))?;
        let pipeline = self
            .device
            .new_compute_pipeline_state_with_function(&function)
            .map_err(|e| RopeError::Device(format!("failed to build pipeline {key}: {e}")))?;
        cache.insert(key, pipeline.to_owned());
        Ok(pipeline)
    }

    fn buffer_from<T: Copy>(&self, data: &[T]) -> Buffer {
        // Zero-length Metal buffers are invalid; allocate one element.
        let bytes = std::mem::size_of_val(data).max(std::mem::size_of::<T>()) as u64;
        if data.is_empty() {
            self.device.new_buffer(bytes, MTLResourceOptions::StorageModeShared)
        } else {
            self.device
                .new_buffer_with_data(data.as_ptr().cast(), bytes, MTLResourceOptions::StorageModeShared)
        }
    }
}

impl QueueDevice for MetalDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn lane_count(&self) -> usize {
        MAX_WORK_GROUP
    }

    fn execute(&self, request: &RotaryRequest) -> Result<()> {
        if request.dtype() != DType::F32 {
            return Err(RopeError::UnsupportedDType {
                what: "Metal rotary_embedding",
                dtype: request.dtype(),
            });
        }
        let shape = request.shape;
        if shape.num_tokens == 0 {
            return Ok(());
        }
        let to_u32 = |v: usize, what: &str| {
            u32::try_from(v).map_err(|_| RopeError::InvalidArgument(format!("{what} {v} exceeds u32")))
        };
        let params = RotaryParams {
            num_heads: to_u32(shape.num_heads, "num_heads")?,
            num_kv_heads: to_u32(shape.num_kv_heads, "num_kv_heads")?,
            head_size: to_u32(shape.head_size, "head_size")?,
            rot_dim: to_u32(shape.rot_dim, "rot_dim")?,
            query_stride: to_u32(shape.query_stride, "query_stride")?,
            key_stride: to_u32(shape.key_stride, "key_stride")?,
            is_neox: u32::from(request.style.is_neox()),
        };
        let positions = request
            .positions
            .iter()
            .map(|&p| u32::try_from(p).map_err(|_| RopeError::InvalidArgument(format!("position {p} exceeds u32"))))
            .collect::<Result<Vec<_>>>()?;
        let pipeline = self.pipeline(ROTARY_F32)?;
        let group = shape
            .work_group_size(MAX_WORK_GROUP)
            .min(pipeline.max_total_threads_per_threadgroup() as usize) as u64;

        request.with_buffers::<f32, _>(|query, key, cache| {
            let q_buf = self.buffer_from(query);
            let k_buf = self.buffer_from(key);
            let c_buf = self.buffer_from(cache);
            let p_buf = self.buffer_from(&positions);

            let command_buffer = self.queue.new_command_buffer();
            let encoder = command_buffer.new_compute_command_encoder();
            encoder.set_compute_pipeline_state(&pipeline);
            encoder.set_buffer(0, Some(&q_buf), 0);
            encoder.set_buffer(1, Some(&k_buf), 0);
            encoder.set_buffer(2, Some(&c_buf), 0);
            encoder.set_buffer(3, Some(&p_buf), 0);
            encoder.set_bytes(
                4,
                std::mem::size_of::<RotaryParams>() as u64,
                (&params as *const RotaryParams).cast(),
            );
            encoder.dispatch_thread_groups(
                MTLSize {
                    width: shape.num_tokens as u64,
                    height: 1,
                    depth: 1,
                },
                MTLSize {
                    width: group,
                    height: 1,
                    depth: 1,
                },
            );
            encoder.end_encoding();
            command_buffer.commit();
            command_buffer.wait_until_completed();

            let status = command_buffer.status();
            if status != MTLCommandBufferStatus::Completed {
                return Err(RopeError::KernelFault(format!(
                    "command buffer finished with status {status:?}"
                )));
            }
            copy_back(&q_buf, query)?;
            copy_back(&k_buf, key)
        })?
    }
}

fn copy_back(buffer: &Buffer, dst: &mut [f32]) -> Result<()> {
    let src = buffer.contents() as *const f32;
    if src.is_null() {
        return Err(RopeError::Device("Metal buffer contents pointer was null".into()));
    }
    // SAFETY: the buffer was created from `dst.len()` f32 values and the
    // command buffer that wrote it has completed.
    unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
    Ok(())
}
