//! Rotary positional embedding (RoPE) operator core.
//!
//! `rotary-core` provides the foundational types (`Tensor`, `DType`, `Shape`),
//! the shape/stride resolver, the reference rotary transform and the
//! backend-agnostic dispatch shim that hands validated work to a backend.
//!
//! # Backends
//!
//! - `rotary-cpu`: generic parallel host backend (rayon)
//! - `rotary-queue`: vendor command-queue backend with asynchronous submission

pub mod backend;
pub mod cache;
pub mod config;
pub mod kernel;
pub mod op;
pub mod shape;
pub mod tensor;
pub mod types;

pub use backend::{Backend, BackendKind, Completion, ReferenceBackend, RotaryRequest, Signal};
pub use cache::{CosSinCache, RopeScaling};
pub use config::RopeConfig;
pub use kernel::RotaryStyle;
pub use op::{RotaryEmbedding, rotary_embedding, rotary_embedding_sync};
pub use shape::RotaryShape;
pub use tensor::Tensor;
pub use types::{DType, Element, Shape};

pub type Result<T> = std::result::Result<T, RopeError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RopeError {
    #[error("Shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        got: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported dtype for {what}: {dtype}")]
    UnsupportedDType { what: &'static str, dtype: DType },

    #[error("Backend not available: {0}")]
    BackendUnavailable(&'static str),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Kernel fault: {0}")]
    KernelFault(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
