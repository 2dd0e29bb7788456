//! Vendor command-queue backend.
//!
//! Submissions are enqueued on a [`CommandQueue`] and return a pending
//! [`Completion`] immediately; a worker thread feeds them in order to a
//! [`QueueDevice`]. The host lane device works everywhere; on macOS a Metal
//! device is available as well.

pub mod device;
#[cfg(target_os = "macos")]
pub mod metal_device;
pub mod queue;

use std::sync::Arc;

use tracing::info;

use rotary_core::{Backend, BackendKind, Completion, Result, RopeError, RotaryRequest};

pub use device::{HostLaneDevice, QueueDevice};
pub use queue::CommandQueue;

/// [`Backend`] that submits into a device command queue.
pub struct QueueBackend {
    name: String,
    lanes: usize,
    queue: CommandQueue,
}

impl QueueBackend {
    pub fn new<D: QueueDevice + 'static>(device: D) -> Result<Self> {
        let name = format!("vendor-queue:{}", device.name());
        let lanes = device.lane_count();
        let queue = CommandQueue::new(Arc::new(device))?;
        info!(backend = %name, lanes, "Initialized queue backend");
        Ok(Self { name, lanes, queue })
    }

    /// Wait for every command submitted so far.
    pub fn synchronize(&self) -> Result<()> {
        self.queue.synchronize()
    }

    pub fn last_error(&self) -> Option<RopeError> {
        self.queue.last_error()
    }
}

impl Backend for QueueBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::VendorQueue
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn lane_count(&self) -> usize {
        self.lanes
    }

    fn submit(&self, request: RotaryRequest) -> Result<Completion> {
        self.queue.submit(request)
    }
}

/// Queue backend on a host lane device with one lane per CPU.
pub fn queue_backend() -> Result<Arc<QueueBackend>> {
    Ok(Arc::new(QueueBackend::new(HostLaneDevice::with_default_lanes()?)?))
}

/// Queue backend on the system Metal device.
#[cfg(target_os = "macos")]
pub fn metal_queue_backend() -> Result<Arc<QueueBackend>> {
    Ok(Arc::new(QueueBackend::new(metal_device::MetalDevice::new()?)?))
}
