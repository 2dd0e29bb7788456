//! Precomputed cos/sin table, indexed by position id.
//!
//! Row `p` holds `cos(p * inv_freq) || sin(p * inv_freq)` with
//! `inv_freq[i] = base^(-2i / rot_dim)`.

use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;
use crate::types::{DType, Element, Shape};
use crate::{Result, RopeError};

/// Position scaling applied while building the table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RopeScaling {
    #[default]
    None,
    /// Position interpolation: positions are divided by `factor`.
    Linear { factor: f32 },
}

/// Builder for a `[max_position, rot_dim]` cos/sin cache tensor.
#[derive(Clone, Debug)]
pub struct CosSinCache {
    rot_dim: usize,
    max_position: usize,
    base: f32,
    scaling: RopeScaling,
}

impl CosSinCache {
    pub fn builder(rot_dim: usize, max_position: usize) -> Self {
        Self {
            rot_dim,
            max_position,
            base: 10_000.0,
            scaling: RopeScaling::None,
        }
    }

    pub fn base(mut self, base: f32) -> Self {
        self.base = base;
        self
    }

    pub fn scaling(mut self, scaling: RopeScaling) -> Self {
        self.scaling = scaling;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.rot_dim == 0 || self.rot_dim % 2 != 0 {
            return Err(RopeError::InvalidArgument(format!(
                "rot_dim must be positive and even, got {}",
                self.rot_dim
            )));
        }
        if self.max_position == 0 {
            return Err(RopeError::InvalidArgument(
                "max_position must be positive".into(),
            ));
        }
        if !(self.base > 0.0) {
            return Err(RopeError::InvalidArgument(format!(
                "rope base must be positive, got {}",
                self.base
            )));
        }
        if let RopeScaling::Linear { factor } = self.scaling
            && !(factor > 0.0)
        {
            return Err(RopeError::InvalidArgument(format!(
                "linear scaling factor must be positive, got {factor}"
            )));
        }
        Ok(())
    }

    /// Table values in f32, row-major.
    pub fn values(&self) -> Result<Vec<f32>> {
        self.validate()?;
        let half = self.rot_dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1.0 / self.base.powf((2 * i) as f32 / self.rot_dim as f32))
            .collect();
        let scale = match self.scaling {
            RopeScaling::None => 1.0,
            RopeScaling::Linear { factor } => 1.0 / factor,
        };

        let mut out = vec![0.0f32; self.max_position * self.rot_dim];
        for (p, row) in out.chunks_exact_mut(self.rot_dim).enumerate() {
            let t = p as f32 * scale;
            let (cos, sin) = row.split_at_mut(half);
            for (i, &f) in inv_freq.iter().enumerate() {
                let (s, c) = (t * f).sin_cos();
                cos[i] = c;
                sin[i] = s;
            }
        }
        Ok(out)
    }

    /// Build the table as a dense tensor of element type `T`.
    pub fn build<T: Element>(&self) -> Result<Tensor> {
        let values = self.values()?;
        let data = values.into_iter().map(T::from_f32).collect();
        Tensor::from_vec::<T>(data, &self.shape())
    }

    /// Build the table as a dense tensor of a runtime-chosen floating dtype.
    pub fn build_dtype(&self, dtype: DType) -> Result<Tensor> {
        let values = self.values()?;
        Tensor::from_f32_as(&values, &self.shape(), dtype)
    }

    fn shape(&self) -> Shape {
        Shape::new([self.max_position as i64, self.rot_dim as i64])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_zero_is_identity() {
        let values = CosSinCache::builder(8, 4).values().unwrap();
        assert_eq!(&values[..4], &[1.0; 4]);
        assert_eq!(&values[4..8], &[0.0; 4]);
    }

    #[test]
    fn test_first_pair_uses_unit_frequency() {
        let values = CosSinCache::builder(4, 3).values().unwrap();
        // Row 2, pair 0: angle = 2 * base^0 = 2.
        let row = &values[8..12];
        assert!((row[0] - 2.0f32.cos()).abs() < 1e-6);
        assert!((row[2] - 2.0f32.sin()).abs() < 1e-6);
        // Pair 1: angle = 2 / sqrt(base) = 0.02.
        assert!((row[3] - 0.02f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_linear_scaling_interpolates_positions() {
        let plain = CosSinCache::builder(4, 8).values().unwrap();
        let scaled = CosSinCache::builder(4, 8)
            .scaling(RopeScaling::Linear { factor: 2.0 })
            .values()
            .unwrap();
        // Scaled position 4 lands on plain position 2.
        assert_eq!(&scaled[16..20], &plain[8..12]);
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(CosSinCache::builder(3, 8).values().is_err());
        assert!(CosSinCache::builder(4, 0).values().is_err());
        assert!(CosSinCache::builder(4, 8).base(0.0).values().is_err());
        assert!(
            CosSinCache::builder(4, 8)
                .scaling(RopeScaling::Linear { factor: 0.0 })
                .values()
                .is_err()
        );
    }

    #[test]
    fn test_build_shape_and_dtype() {
        let t = CosSinCache::builder(16, 32).build_dtype(DType::BF16).unwrap();
        assert_eq!(t.shape(), &Shape::new([32, 16]));
        assert_eq!(t.dtype(), DType::BF16);
        let f = CosSinCache::builder(16, 32).build::<f32>().unwrap();
        assert_eq!(f.dtype(), DType::F32);
    }
}
