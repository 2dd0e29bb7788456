//! Reference rotary transform over host slices.
//!
//! Each rotation pair `(x1, x2)` of a head becomes
//! `(x1 * cos - x2 * sin, x2 * cos + x1 * sin)`. Elements of a head at index
//! `>= rot_dim` are never touched.
//!
//! Rows are rotated in place. Both slots of a pair are loaded before either
//! is stored, and the pairs of one head are disjoint, so the order in which
//! pairs (or heads, or tokens) are visited does not affect the result. Every
//! backend relies on this to split the work freely.

use crate::shape::RotaryShape;
use crate::types::Element;
use crate::{Result, RopeError};

/// How the elements of a head are paired for rotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RotaryStyle {
    /// GPT-NeoX: element `i` pairs with `i + rot_dim / 2`.
    Neox,
    /// GPT-J: adjacent elements `2i` and `2i + 1` pair up.
    Interleaved,
}

impl RotaryStyle {
    pub fn from_is_neox(is_neox: bool) -> Self {
        if is_neox {
            RotaryStyle::Neox
        } else {
            RotaryStyle::Interleaved
        }
    }

    pub fn is_neox(self) -> bool {
        self == RotaryStyle::Neox
    }
}

impl std::fmt::Display for RotaryStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotaryStyle::Neox => write!(f, "neox"),
            RotaryStyle::Interleaved => write!(f, "interleaved"),
        }
    }
}

/// Indices within a head of rotation pair `i`.
#[inline]
pub fn pair_indices(style: RotaryStyle, i: usize, embed_dim: usize) -> (usize, usize) {
    match style {
        RotaryStyle::Neox => (i, i + embed_dim),
        RotaryStyle::Interleaved => (2 * i, 2 * i + 1),
    }
}

#[inline]
pub fn rotate_pair<T: Element>(x1: T, x2: T, cos: T, sin: T) -> (T, T) {
    (x1 * cos - x2 * sin, x2 * cos + x1 * sin)
}

/// Rotate the first `2 * cos.len()` elements of every head in `row`.
pub fn rotate_heads<T: Element>(
    row: &mut [T],
    num_heads: usize,
    head_size: usize,
    cos: &[T],
    sin: &[T],
    style: RotaryStyle,
) {
    let embed_dim = cos.len();
    for head in row.chunks_exact_mut(head_size).take(num_heads) {
        for i in 0..embed_dim {
            let (a, b) = pair_indices(style, i, embed_dim);
            let x1 = head[a];
            let x2 = head[b];
            let (y1, y2) = rotate_pair(x1, x2, cos[i], sin[i]);
            head[a] = y1;
            head[b] = y2;
        }
    }
}

/// Rotate one token's query and key rows with that token's cache row.
///
/// `cos_sin_row` is `cos[0..rot_dim/2] || sin[0..rot_dim/2]`.
pub fn rotate_token<T: Element>(
    query_row: &mut [T],
    key_row: &mut [T],
    cos_sin_row: &[T],
    shape: &RotaryShape,
    style: RotaryStyle,
) {
    let (cos, sin) = cos_sin_row[..shape.rot_dim].split_at(shape.embed_dim());
    rotate_heads(query_row, shape.num_heads, shape.head_size, cos, sin, style);
    rotate_heads(key_row, shape.num_kv_heads, shape.head_size, cos, sin, style);
}

/// The cache row for `position`, bounds-checked.
pub fn cos_sin_row<T>(cache: &[T], rot_dim: usize, position: i64) -> Result<&[T]> {
    let max_position = cache.len() / rot_dim.max(1);
    if position < 0 || position as usize >= max_position {
        return Err(RopeError::InvalidArgument(format!(
            "position {position} out of range for cache of {max_position} positions"
        )));
    }
    let start = position as usize * rot_dim;
    Ok(&cache[start..start + rot_dim])
}

/// Check that `len` elements hold `rows` rows of `width` at `stride`.
pub fn check_rows(what: &'static str, len: usize, rows: usize, width: usize, stride: usize) -> Result<()> {
    let required = if rows == 0 { 0 } else { (rows - 1) * stride + width };
    if stride < width || (rows > 0 && stride == 0) || len < required {
        return Err(RopeError::ShapeMismatch {
            what,
            expected: format!("{rows} rows of {width} at stride {stride} ({required} elements)"),
            got: format!("{len} elements"),
        });
    }
    Ok(())
}

/// Sequential rotary embedding of every token, in place.
///
/// `query`/`key` are raw row-strided buffers laid out per `shape`; `cache` is
/// a dense `[max_position, rot_dim]` table.
pub fn apply_reference<T: Element>(
    positions: &[i64],
    query: &mut [T],
    key: &mut [T],
    cache: &[T],
    shape: &RotaryShape,
    style: RotaryStyle,
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
    // Resolve every cache row before the first write.
    let rows = positions
        .iter()
        .map(|&p| cos_sin_row(cache, shape.rot_dim, p))
        .collect::<Result<Vec<_>>>()?;

    for (t, cs) in rows.into_iter().enumerate() {
        let q = &mut query[t * shape.query_stride..t * shape.query_stride + shape.query_width()];
        let k = &mut key[t * shape.key_stride..t * shape.key_stride + shape.key_width()];
        rotate_token(q, k, cs, shape, style);
    }
    Ok(())
}
