//! Rotary embedding configuration, as found in model config files.

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::cache::{CosSinCache, RopeScaling};
use crate::kernel::RotaryStyle;
use crate::types::DType;
use crate::{Result, RopeError};

fn default_theta() -> f32 {
    10_000.0
}

fn default_neox() -> bool {
    true
}

fn default_dtype() -> DType {
    DType::F32
}

fn default_max_position() -> usize {
    2048
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RopeConfig {
    pub head_size: usize,
    /// Defaults to `head_size` (full rotation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotary_dim: Option<usize>,
    #[serde(default = "default_max_position")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_neox")]
    pub is_neox_style: bool,
    #[serde(default = "default_dtype")]
    pub dtype: DType,
    #[serde(default)]
    pub rope_scaling: RopeScaling,
    /// Backend named by the config file, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
}

impl RopeConfig {
    pub fn new(head_size: usize, max_position_embeddings: usize) -> Self {
        Self {
            head_size,
            rotary_dim: None,
            max_position_embeddings,
            rope_theta: default_theta(),
            is_neox_style: default_neox(),
            dtype: default_dtype(),
            rope_scaling: RopeScaling::None,
            backend: None,
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s).map_err(|e| RopeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn rot_dim(&self) -> usize {
        self.rotary_dim.unwrap_or(self.head_size)
    }

    pub fn style(&self) -> RotaryStyle {
        RotaryStyle::from_is_neox(self.is_neox_style)
    }

    pub fn validate(&self) -> Result<()> {
        let rot_dim = self.rot_dim();
        if self.head_size == 0 {
            return Err(RopeError::Config("head_size must be positive".into()));
        }
        if rot_dim == 0 || rot_dim % 2 != 0 || rot_dim > self.head_size {
            return Err(RopeError::Config(format!(
                "rotary_dim {rot_dim} must be even and in 1..={}",
                self.head_size
            )));
        }
        if !self.dtype.is_float() {
            return Err(RopeError::Config(format!(
                "dtype {} is not a floating type",
                self.dtype
            )));
        }
        Ok(())
    }

    /// Pick the backend: `explicit` first, then the config file, then the
    /// `ROTARY_BACKEND` value `env`, then `GenericParallel`.
    pub fn backend_kind(&self, explicit: Option<BackendKind>, env: Option<&str>) -> BackendKind {
        explicit
            .or(self.backend)
            .unwrap_or_else(|| BackendKind::from_env_value(env))
    }

    /// Cache builder matching this configuration.
    pub fn cache_builder(&self) -> CosSinCache {
        CosSinCache::builder(self.rot_dim(), self.max_position_embeddings)
            .base(self.rope_theta)
            .scaling(self.rope_scaling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let c = RopeConfig::from_json_str(r#"{"head_size": 64}"#).unwrap();
        assert_eq!(c.rot_dim(), 64);
        assert_eq!(c.max_position_embeddings, 2048);
        assert_eq!(c.rope_theta, 10_000.0);
        assert_eq!(c.style(), RotaryStyle::Neox);
        assert_eq!(c.dtype, DType::F32);
        assert_eq!(c.backend, None);
    }

    #[test]
    fn test_full_json() {
        let c = RopeConfig::from_json_str(
            r#"{
                "head_size": 128,
                "rotary_dim": 64,
                "max_position_embeddings": 4096,
                "rope_theta": 500000.0,
                "is_neox_style": false,
                "dtype": "bf16",
                "rope_scaling": {"type": "linear", "factor": 4.0},
                "backend": "vendor_queue"
            }"#,
        )
        .unwrap();
        assert_eq!(c.rot_dim(), 64);
        assert_eq!(c.style(), RotaryStyle::Interleaved);
        assert_eq!(c.dtype, DType::BF16);
        assert_eq!(c.rope_scaling, RopeScaling::Linear { factor: 4.0 });
        assert_eq!(c.backend, Some(BackendKind::VendorQueue));
    }

    #[test]
    fn test_backend_selection_order() {
        let plain = RopeConfig::new(8, 16);
        let pinned = RopeConfig::from_json_str(r#"{"head_size": 8, "backend": "vendor_queue"}"#).unwrap();

        // Explicit choice wins over the file and the environment.
        assert_eq!(
            pinned.backend_kind(Some(BackendKind::GenericParallel), Some("vendor")),
            BackendKind::GenericParallel
        );
        // The file wins over the environment.
        assert_eq!(pinned.backend_kind(None, Some("generic")), BackendKind::VendorQueue);
        // Without either, the environment decides.
        assert_eq!(plain.backend_kind(None, Some("QUEUE")), BackendKind::VendorQueue);
        assert_eq!(plain.backend_kind(None, None), BackendKind::GenericParallel);
    }

    #[test]
    fn test_invalid_rotary_dim_rejected() {
        let err = RopeConfig::from_json_str(r#"{"head_size": 64, "rotary_dim": 65}"#).unwrap_err();
        assert!(matches!(err, RopeError::Config(_)));
        assert!(RopeConfig::from_json_str(r#"{"head_size": 64, "rotary_dim": 128}"#).is_err());
    }

    #[test]
    fn test_integer_dtype_rejected() {
        assert!(RopeConfig::from_json_str(r#"{"head_size": 8, "dtype": "i64"}"#).is_err());
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = RopeConfig::from_json_str("{").unwrap_err();
        assert!(matches!(err, RopeError::Config(_)));
    }
}
