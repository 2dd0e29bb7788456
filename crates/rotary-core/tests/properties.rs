//! Behavioral properties of the rotary embedding operator, exercised through
//! the public dispatch shim with the reference backend.

use proptest::prelude::*;
use rotary_core::{
    CosSinCache, ReferenceBackend, RopeError, Shape, Tensor, rotary_embedding, rotary_embedding_sync,
};

fn tensor(data: &[f32], dims: &[i64]) -> Tensor {
    Tensor::from_vec(data.to_vec(), &Shape::new(dims)).unwrap()
}

fn positions(ids: &[i64]) -> Tensor {
    Tensor::from_vec(ids.to_vec(), &Shape::new([ids.len() as i64])).unwrap()
}

fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tol, "element {i}: actual={a}, expected={e}");
    }
}

// ── Fixed cases ─────────────────────────────────────────────────────────

#[test]
fn neox_identity_rotation_leaves_input_unchanged() {
    let x = [0.25, -3.5, 1.0, 8.0];
    let q = tensor(&x, &[1, 4]);
    let k = tensor(&x, &[1, 4]);
    let cache = tensor(&[1.0, 1.0, 0.0, 0.0], &[1, 4]);
    rotary_embedding_sync(&ReferenceBackend, &positions(&[0]), &q, &k, 4, &cache, true).unwrap();
    assert_eq!(q.to_vec::<f32>().unwrap(), x.to_vec());
    assert_eq!(k.to_vec::<f32>().unwrap(), x.to_vec());
}

#[test]
fn neox_quarter_turn() {
    let q = tensor(&[1.0, 0.0], &[1, 2]);
    let k = tensor(&[0.0, 1.0], &[1, 2]);
    let cache = tensor(&[0.0, 1.0], &[1, 2]);
    rotary_embedding_sync(&ReferenceBackend, &positions(&[0]), &q, &k, 2, &cache, true).unwrap();
    assert_eq!(q.to_vec::<f32>().unwrap(), vec![0.0, 1.0]);
    assert_eq!(k.to_vec::<f32>().unwrap(), vec![-1.0, 0.0]);
}

#[test]
fn interleaved_and_neox_pair_different_indices() {
    let x = [1.0, 2.0, 3.0, 4.0];
    let cache = tensor(&[0.0, 0.0, 1.0, 1.0], &[1, 4]);

    let q_neox = tensor(&x, &[1, 4]);
    let k_neox = tensor(&x, &[1, 4]);
    rotary_embedding_sync(&ReferenceBackend, &positions(&[0]), &q_neox, &k_neox, 4, &cache, true)
        .unwrap();

    let q_gptj = tensor(&x, &[1, 4]);
    let k_gptj = tensor(&x, &[1, 4]);
    rotary_embedding_sync(&ReferenceBackend, &positions(&[0]), &q_gptj, &k_gptj, 4, &cache, false)
        .unwrap();

    // Split-half pairs (0, 2), (1, 3).
    assert_eq!(q_neox.to_vec::<f32>().unwrap(), vec![-3.0, -4.0, 1.0, 2.0]);
    // Adjacent pairs (0, 1), (2, 3).
    assert_eq!(q_gptj.to_vec::<f32>().unwrap(), vec![-2.0, 1.0, -4.0, 3.0]);
}

#[test]
fn rejected_query_shape_leaves_key_untouched() {
    let q = tensor(&[1.0; 6], &[1, 6]);
    let k_data = [0.5, 1.5, 2.5, 3.5];
    let k = tensor(&k_data, &[1, 4]);
    let cache = tensor(&[0.0, 1.0, 1.0, 0.0], &[1, 4]);

    // head_size 4 does not divide the query width 6.
    let err = rotary_embedding(&ReferenceBackend, &positions(&[0]), &q, &k, 4, &cache, true)
        .unwrap_err();
    assert!(matches!(err, RopeError::ShapeMismatch { what: "query last dim", .. }));
    assert_eq!(k.to_vec::<f32>().unwrap(), k_data.to_vec());
    assert_eq!(q.to_vec::<f32>().unwrap(), vec![1.0; 6]);
}

#[test]
fn multi_head_gqa_shares_cache_row() {
    // 4 query heads, 2 kv heads, head_size 2, one token at position 1.
    let cache = CosSinCache::builder(2, 4).build::<f32>().unwrap();
    let q = tensor(&[1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0], &[1, 8]);
    let k = tensor(&[1.0, 0.0, 1.0, 0.0], &[1, 4]);
    rotary_embedding_sync(&ReferenceBackend, &positions(&[1]), &q, &k, 2, &cache, true).unwrap();

    let (s, c) = 1.0f32.sin_cos();
    let q = q.to_vec::<f32>().unwrap();
    for head in q.chunks(2) {
        assert_close(head, &[c, s], 1e-6);
    }
    assert_close(&k.to_vec::<f32>().unwrap(), &[c, s, c, s], 1e-6);
}

#[test]
fn batched_positions_and_padded_rows() {
    let cache = CosSinCache::builder(4, 8).build::<f32>().unwrap();

    // [batch=2, seq=2, width=4] query with rows padded to 6.
    let mut padded = Vec::new();
    for r in 0..4 {
        padded.extend_from_slice(&[r as f32, 1.0, -1.0, 0.5, 99.0, 99.0]);
    }
    let q = Tensor::with_row_stride(padded, &Shape::new([2, 2, 4]), 6).unwrap();
    let dense: Vec<f32> = (0..4).flat_map(|r| [r as f32, 1.0, -1.0, 0.5]).collect();
    let q_dense = tensor(&dense, &[2, 2, 4]);
    let k = tensor(&dense, &[2, 2, 4]);
    let k2 = tensor(&dense, &[2, 2, 4]);
    let pos = Tensor::from_vec(vec![0i64, 1, 2, 3], &Shape::new([2, 2])).unwrap();

    rotary_embedding_sync(&ReferenceBackend, &pos, &q, &k, 4, &cache, true).unwrap();
    rotary_embedding_sync(&ReferenceBackend, &pos, &q_dense, &k2, 4, &cache, true).unwrap();

    assert_eq!(q.to_vec::<f32>().unwrap(), q_dense.to_vec::<f32>().unwrap());
    // Padding is never written.
    q.with_slice::<f32, _>(|raw| {
        for r in 0..4 {
            assert_eq!(&raw[r * 6 + 4..r * 6 + 6], &[99.0, 99.0]);
        }
    })
    .unwrap();
}

#[test]
fn half_precision_tracks_f32_within_tolerance() {
    use rotary_core::DType;

    let data: Vec<f32> = (0..32).map(|i| (i as f32) * 0.0625 - 1.0).collect();
    let ids = [3i64, 0, 7, 5];
    let mut results = Vec::new();
    for dtype in [DType::F32, DType::F16, DType::BF16] {
        let cache = CosSinCache::builder(8, 8).build_dtype(dtype).unwrap();
        let q = Tensor::from_f32_as(&data, &Shape::new([4, 8]), dtype).unwrap();
        let k = Tensor::from_f32_as(&data, &Shape::new([4, 8]), dtype).unwrap();
        rotary_embedding_sync(&ReferenceBackend, &positions(&ids), &q, &k, 8, &cache, false).unwrap();
        results.push(q.to_vec_f32().unwrap());
    }
    assert_close(&results[1], &results[0], 1e-2);
    assert_close(&results[2], &results[0], 5e-2);
}

// ── Randomized properties ───────────────────────────────────────────────

/// (num_tokens, num_heads, head_size, rot_dim, is_neox)
fn arb_layout() -> impl Strategy<Value = (usize, usize, usize, usize, bool)> {
    (1usize..=6, 1usize..=4, 1usize..=8, any::<bool>()).prop_flat_map(|(tokens, heads, half_head, neox)| {
        let head_size = half_head * 2;
        (1..=half_head).prop_map(move |half_rot| (tokens, heads, head_size, half_rot * 2, neox))
    })
}

fn arb_case() -> impl Strategy<Value = ((usize, usize, usize, usize, bool), Vec<f32>, Vec<f32>)> {
    arb_layout().prop_flat_map(|layout| {
        let (tokens, heads, head_size, _, _) = layout;
        let n = tokens * heads * head_size;
        (
            Just(layout),
            prop::collection::vec(-4.0f32..4.0, n),
            prop::collection::vec(-std::f32::consts::PI..std::f32::consts::PI, tokens),
        )
    })
}

/// A cache with one row per token, row `t` rotating pair `i` by `angles[t] * (i + 1)`.
fn angle_cache(angles: &[f32], rot_dim: usize, negate: bool) -> Tensor {
    let half = rot_dim / 2;
    let mut data = Vec::with_capacity(angles.len() * rot_dim);
    for &a in angles {
        let (cos, sin): (Vec<f32>, Vec<f32>) = (0..half)
            .map(|i| {
                let (s, c) = (a * (i + 1) as f32).sin_cos();
                (c, if negate { -s } else { s })
            })
            .unzip();
        data.extend(cos);
        data.extend(sin);
    }
    tensor(&data, &[angles.len() as i64, rot_dim as i64])
}

proptest! {
    #[test]
    fn prop_tail_beyond_rot_dim_passes_through((layout, x, angles) in arb_case()) {
        let (tokens, heads, head_size, rot_dim, neox) = layout;
        let width = (heads * head_size) as i64;
        let q = tensor(&x, &[tokens as i64, width]);
        let k = tensor(&x, &[tokens as i64, width]);
        let cache = angle_cache(&angles, rot_dim, false);
        let ids: Vec<i64> = (0..tokens as i64).collect();
        rotary_embedding_sync(&ReferenceBackend, &positions(&ids), &q, &k, head_size as i64, &cache, neox).unwrap();

        let out = q.to_vec::<f32>().unwrap();
        for (head_out, head_in) in out.chunks(head_size).zip(x.chunks(head_size)) {
            prop_assert_eq!(&head_out[rot_dim..], &head_in[rot_dim..]);
        }
    }

    #[test]
    fn prop_inverse_rotation_restores_input((layout, x, angles) in arb_case()) {
        let (tokens, heads, head_size, rot_dim, neox) = layout;
        let width = (heads * head_size) as i64;
        let q = tensor(&x, &[tokens as i64, width]);
        let k = tensor(&x, &[tokens as i64, width]);
        let ids: Vec<i64> = (0..tokens as i64).collect();
        let pos = positions(&ids);

        let forward = angle_cache(&angles, rot_dim, false);
        let backward = angle_cache(&angles, rot_dim, true);
        rotary_embedding_sync(&ReferenceBackend, &pos, &q, &k, head_size as i64, &forward, neox).unwrap();
        rotary_embedding_sync(&ReferenceBackend, &pos, &q, &k, head_size as i64, &backward, neox).unwrap();

        for (a, e) in q.to_vec::<f32>().unwrap().iter().zip(&x) {
            prop_assert!((a - e).abs() <= 1e-4, "actual={} expected={}", a, e);
        }
    }

    #[test]
    fn prop_permuting_positions_permutes_outputs(
        (layout, x, angles) in arb_case(),
        seed in any::<u64>()
    ) {
        let (tokens, heads, head_size, rot_dim, neox) = layout;
        let row = heads * head_size;
        let width = row as i64;
        let cache = angle_cache(&angles, rot_dim, false);

        // Token t of the original batch carries position t.
        let ids: Vec<i64> = (0..tokens as i64).collect();
        let q = tensor(&x, &[tokens as i64, width]);
        let k = tensor(&x, &[tokens as i64, width]);
        rotary_embedding_sync(&ReferenceBackend, &positions(&ids), &q, &k, head_size as i64, &cache, neox).unwrap();
        let base = q.to_vec::<f32>().unwrap();

        // Rotate the batch by `shift` tokens, positions moving with their rows.
        let shift = (seed as usize) % tokens;
        let perm: Vec<usize> = (0..tokens).map(|t| (t + shift) % tokens).collect();
        let permuted_x: Vec<f32> = perm.iter().flat_map(|&t| x[t * row..(t + 1) * row].to_vec()).collect();
        let permuted_ids: Vec<i64> = perm.iter().map(|&t| t as i64).collect();
        let q2 = tensor(&permuted_x, &[tokens as i64, width]);
        let k2 = tensor(&permuted_x, &[tokens as i64, width]);
        rotary_embedding_sync(&ReferenceBackend, &positions(&permuted_ids), &q2, &k2, head_size as i64, &cache, neox).unwrap();
        let out = q2.to_vec::<f32>().unwrap();

        for (slot, &t) in perm.iter().enumerate() {
            prop_assert_eq!(&out[slot * row..(slot + 1) * row], &base[t * row..(t + 1) * row]);
        }
    }
}
