//! Backend parity harness.
//!
//! Builds the same rotary embedding call for a backend under test and for the
//! sequential reference backend with identical input data, runs both, and
//! asserts element-wise closeness. Backends may differ in internal precision,
//! so comparisons use tolerances rather than exact equality.

use rotary_core::{
    Backend, CosSinCache, DType, ReferenceBackend, Result, RotaryStyle, Shape, Tensor,
    rotary_embedding,
};

/// Deterministic f32 data generation using a simple LCG.
///
/// Produces `n` values in roughly [-1, 1] from the given seed.
/// Not cryptographically random, only reproducible across platforms.
pub fn gen_data(n: usize, seed: u64) -> Vec<f32> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            // LCG: Numerical Recipes parameters
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) as f64 / (1u64 << 31) as f64 * 2.0 - 1.0) as f32
        })
        .collect()
}

/// Deterministic position ids in `[0, max_position)`.
pub fn gen_positions(n: usize, max_position: usize, seed: u64) -> Vec<i64> {
    let mut state = seed ^ 0x9e37_79b9_7f4a_7c15;
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) % max_position.max(1) as u64) as i64
        })
        .collect()
}

/// Assert two f32 slices are element-wise close.
pub fn assert_allclose(actual: &[f32], expected: &[f32], atol: f32, rtol: f32) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "length mismatch: actual={} expected={}",
        actual.len(),
        expected.len()
    );
    for (i, (x, y)) in actual.iter().zip(expected.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        assert!(
            diff <= tol,
            "mismatch at [{i}]: actual={x} expected={y} diff={diff} tol={tol}"
        );
    }
}

/// Largest absolute element-wise difference.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

/// One rotary embedding problem.
#[derive(Clone, Debug)]
pub struct RotaryCase {
    pub tokens: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub rot_dim: usize,
    pub max_position: usize,
    /// Extra elements appended to every query row.
    pub query_padding: usize,
    pub style: RotaryStyle,
    pub dtype: DType,
    pub seed: u64,
}

impl RotaryCase {
    /// Full-rotation f32 neox case with one kv head per query head.
    pub fn new(tokens: usize, num_heads: usize, head_size: usize) -> Self {
        Self {
            tokens,
            num_heads,
            num_kv_heads: num_heads,
            head_size,
            rot_dim: head_size,
            max_position: 4096,
            query_padding: 0,
            style: RotaryStyle::Neox,
            dtype: DType::F32,
            seed: 7,
        }
    }

    pub fn kv_heads(mut self, n: usize) -> Self {
        self.num_kv_heads = n;
        self
    }

    pub fn rot_dim(mut self, rot_dim: usize) -> Self {
        self.rot_dim = rot_dim;
        self
    }

    pub fn style(mut self, style: RotaryStyle) -> Self {
        self.style = style;
        self
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn query_padding(mut self, padding: usize) -> Self {
        self.query_padding = padding;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Fresh `(positions, query, key, cache)` tensors for this case.
    pub fn tensors(&self) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        let q_width = self.num_heads * self.head_size;
        let k_width = self.num_kv_heads * self.head_size;
        let q_stride = q_width + self.query_padding;

        let q_dense = gen_data(self.tokens * q_width, self.seed);
        let mut q_data = vec![0.0f32; self.tokens * q_stride];
        for (t, row) in q_dense.chunks(q_width.max(1)).enumerate() {
            q_data[t * q_stride..t * q_stride + row.len()].copy_from_slice(row);
        }
        let k_data = gen_data(self.tokens * k_width, self.seed.wrapping_add(1));
        let ids = gen_positions(self.tokens, self.max_position, self.seed);

        let q_shape = Shape::new([self.tokens as i64, q_width as i64]);
        let query = Tensor::from_f32_strided(&q_data, &q_shape, q_stride, self.dtype)?;
        let key = Tensor::from_f32_as(&k_data, &Shape::new([self.tokens as i64, k_width as i64]), self.dtype)?;
        let positions = Tensor::from_vec(ids, &Shape::new([self.tokens as i64]))?;
        let cache = CosSinCache::builder(self.rot_dim, self.max_position).build_dtype(self.dtype)?;
        Ok((positions, query, key, cache))
    }

    /// Run on `backend`, returning the rotated `(query, key)` as f32.
    pub fn run_on(&self, backend: &dyn Backend) -> Result<(Vec<f32>, Vec<f32>)> {
        let (positions, query, key, cache) = self.tensors()?;
        rotary_embedding(
            backend,
            &positions,
            &query,
            &key,
            self.head_size as i64,
            &cache,
            self.style.is_neox(),
        )?
        .wait()?;
        Ok((query.to_vec_f32()?, key.to_vec_f32()?))
    }
}

/// Run `case` on `backend` and on the reference backend, assert closeness.
pub fn run_parity(backend: &dyn Backend, case: &RotaryCase, atol: f32, rtol: f32) {
    let (q, k) = case.run_on(backend).expect("backend run failed");
    let (q_ref, k_ref) = case.run_on(&ReferenceBackend).expect("reference run failed");
    assert_allclose(&q, &q_ref, atol, rtol);
    assert_allclose(&k, &k_ref, atol, rtol);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_data_deterministic() {
        assert_eq!(gen_data(100, 42), gen_data(100, 42));
        assert_ne!(gen_data(100, 42), gen_data(100, 43));
    }

    #[test]
    fn test_gen_data_range() {
        for &x in &gen_data(10000, 1) {
            assert!((-1.0..=1.0).contains(&x), "value {x} out of range");
        }
    }

    #[test]
    fn test_gen_positions_in_range() {
        let ids = gen_positions(1000, 17, 3);
        assert!(ids.iter().all(|&p| (0..17).contains(&p)));
    }

    #[test]
    fn test_padded_case_keeps_logical_data() {
        let dense = RotaryCase::new(3, 2, 4);
        let padded = dense.clone().query_padding(5);
        let (_, q_dense, _, _) = dense.tensors().unwrap();
        let (_, q_padded, _, _) = padded.tensors().unwrap();
        assert_eq!(q_padded.row_stride(), 13);
        assert_eq!(q_dense.to_vec::<f32>().unwrap(), q_padded.to_vec::<f32>().unwrap());
    }

    #[test]
    fn test_reference_matches_itself() {
        run_parity(&ReferenceBackend, &RotaryCase::new(4, 2, 8), 0.0, 0.0);
    }

    #[test]
    fn test_allclose_within_tolerance() {
        assert_allclose(&[1.0001], &[1.0], 1e-3, 1e-3);
    }

    #[test]
    #[should_panic(expected = "mismatch")]
    fn test_allclose_fails() {
        assert_allclose(&[1.0], &[2.0], 1e-6, 1e-6);
    }
}
