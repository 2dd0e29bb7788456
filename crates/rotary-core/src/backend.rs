//! Backend trait and completion tokens.
//!
//! A `Backend` receives a fully validated `RotaryRequest` and either runs it
//! before returning (`Completion::ready`) or enqueues it and hands back a
//! pending `Completion` that the device side signals later. Callers must
//! `wait()` on the completion before reading query/key.

use std::str::FromStr;
use std::sync::Arc;

use half::{bf16, f16};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::kernel::{RotaryStyle, apply_reference};
use crate::shape::RotaryShape;
use crate::tensor::Tensor;
use crate::types::{DType, Element};
use crate::{Result, RopeError};

/// Environment variable consulted by [`BackendKind::from_env`].
pub const BACKEND_ENV: &str = "ROTARY_BACKEND";

/// One validated rotary embedding call.
#[derive(Clone, Debug)]
pub struct RotaryRequest {
    pub shape: RotaryShape,
    pub positions: Arc<[i64]>,
    pub query: Tensor,
    pub key: Tensor,
    pub cache: Tensor,
    pub style: RotaryStyle,
}

impl RotaryRequest {
    pub fn dtype(&self) -> DType {
        self.query.dtype()
    }

    /// Lock query and key for writing and the cache for reading, typed as `T`.
    ///
    /// Query, key and cache never share storage (checked by the dispatch
    /// shim). The three locks are always taken in ascending storage address
    /// order, so concurrent requests over the same tensors in swapped roles
    /// cannot deadlock.
    pub fn with_buffers<T: Element, R>(
        &self,
        f: impl FnOnce(&mut [T], &mut [T], &[T]) -> R,
    ) -> Result<R> {
        let mut order = [
            (self.query.lock_rank(), 0),
            (self.key.lock_rank(), 1),
            (self.cache.lock_rank(), 2),
        ];
        order.sort_unstable();
        let (mut query, mut key, mut cache) = (None, None, None);
        for (_, slot) in order {
            match slot {
                0 => query = Some(self.query.write()),
                1 => key = Some(self.key.write()),
                _ => cache = Some(self.cache.read()),
            }
        }
        let (Some(mut query), Some(mut key), Some(cache)) = (query, key, cache) else {
            return Err(RopeError::Device("failed to lock request buffers".into()));
        };
        Ok(f(
            query.as_mut_slice::<T>()?,
            key.as_mut_slice::<T>()?,
            cache.as_slice::<T>()?,
        ))
    }

    /// Run the sequential reference transform over this request.
    pub fn run_reference(&self) -> Result<()> {
        dispatch_floating(self, &ReferenceKernel)
    }
}

/// A kernel generic over the floating element type.
pub trait FloatKernel {
    fn run<T: Element>(&self, request: &RotaryRequest) -> Result<()>;
}

/// Instantiate `kernel` for the request's dtype.
pub fn dispatch_floating<K: FloatKernel + ?Sized>(request: &RotaryRequest, kernel: &K) -> Result<()> {
    match request.dtype() {
        DType::F32 => kernel.run::<f32>(request),
        DType::F64 => kernel.run::<f64>(request),
        DType::F16 => kernel.run::<f16>(request),
        DType::BF16 => kernel.run::<bf16>(request),
        dtype => Err(RopeError::UnsupportedDType {
            what: "rotary_embedding",
            dtype,
        }),
    }
}

struct ReferenceKernel;

impl FloatKernel for ReferenceKernel {
    fn run<T: Element>(&self, request: &RotaryRequest) -> Result<()> {
        request.with_buffers::<T, _>(|query, key, cache| {
            apply_reference(
                &request.positions,
                query,
                key,
                cache,
                &request.shape,
                request.style,
            )
        })?
    }
}

/// Pluggable execution strategy, chosen at configuration time.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &str;

    /// Parallel lanes available; only used to size the work partition.
    fn lane_count(&self) -> usize;

    /// Hand a validated request to the backend.
    ///
    /// Returns once the work is enqueued. Errors returned here are
    /// acquisition failures; faults during execution surface through the
    /// returned `Completion`.
    fn submit(&self, request: RotaryRequest) -> Result<Completion>;
}

/// Which backend strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Host work partitioned across a thread pool.
    #[default]
    GenericParallel,
    /// Asynchronous submission into a device command queue.
    VendorQueue,
}

impl BackendKind {
    /// Backend named by `ROTARY_BACKEND`, falling back to `GenericParallel`.
    ///
    /// Unrecognized values are ignored.
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(BACKEND_ENV).ok().as_deref())
    }

    /// [`from_env`](Self::from_env) over an already-read variable value.
    pub fn from_env_value(value: Option<&str>) -> Self {
        value.and_then(|v| v.parse().ok()).unwrap_or_default()
    }
}

impl FromStr for BackendKind {
    type Err = RopeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "generic" | "parallel" | "generic_parallel" | "cpu" => Ok(BackendKind::GenericParallel),
            "vendor" | "queue" | "vendor_queue" | "npu" => Ok(BackendKind::VendorQueue),
            other => Err(RopeError::Config(format!("unknown backend {other:?}"))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::GenericParallel => write!(f, "generic"),
            BackendKind::VendorQueue => write!(f, "vendor"),
        }
    }
}

/// Sequential reference backend, the correctness oracle for the other backends.
pub struct ReferenceBackend;

impl Backend for ReferenceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::GenericParallel
    }

    fn name(&self) -> &str {
        "reference"
    }

    fn lane_count(&self) -> usize {
        1
    }

    fn submit(&self, request: RotaryRequest) -> Result<Completion> {
        request.run_reference()?;
        Ok(Completion::ready())
    }
}

// ── Completion tokens ───────────────────────────────────────────────────

struct Shared {
    state: Mutex<Option<Result<()>>>,
    cond: Condvar,
}

/// Completion token for one submission.
///
/// Dropping it does not cancel the work.
#[must_use = "wait on the completion before reading query/key"]
pub struct Completion {
    shared: Option<Arc<Shared>>,
}

impl Completion {
    /// Work that already finished successfully.
    pub fn ready() -> Self {
        Self { shared: None }
    }

    /// A completion plus the signal the executing side fires when done.
    pub fn pending() -> (Self, Signal) {
        let shared = Arc::new(Shared {
            state: Mutex::new(None),
            cond: Condvar::new(),
        });
        (
            Self {
                shared: Some(Arc::clone(&shared)),
            },
            Signal {
                shared,
                fired: false,
            },
        )
    }

    pub fn is_complete(&self) -> bool {
        match &self.shared {
            None => true,
            Some(shared) => shared.state.lock().is_some(),
        }
    }

    /// Block until the work finishes, returning its device-side result.
    pub fn wait(self) -> Result<()> {
        let Some(shared) = self.shared else {
            return Ok(());
        };
        let mut state = shared.state.lock();
        while state.is_none() {
            shared.cond.wait(&mut state);
        }
        state.take().unwrap_or(Ok(()))
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Executing side of a pending [`Completion`].
///
/// A signal dropped without firing completes its token with a device error.
pub struct Signal {
    shared: Arc<Shared>,
    fired: bool,
}

impl Signal {
    pub fn complete(mut self, result: Result<()>) {
        self.fire(result);
    }

    fn fire(&mut self, result: Result<()>) {
        *self.shared.state.lock() = Some(result);
        self.shared.cond.notify_all();
        self.fired = true;
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        if !self.fired {
            self.fire(Err(RopeError::Device(
                "work dropped before completion".into(),
            )));
        }
    }
}
