//! Rotary position embedding tables and position-indexed application.
//!
//! Tables follow the GPT-NeoX layout: row `p` holds `concat(freqs, freqs)`
//! for position `p`, so a table is `[len, rotary_dim]`. Application gathers
//! rows by explicit position id rather than by storage index, which is what
//! lets cached keys be re-rotated by their current cache slot.

use std::borrow::Cow;

use rayon::prelude::*;

use crate::error::{Result, StreamError};
use crate::tensor::{PositionIds, Tensor};

/// Paired cosine/sine tables, row-major `[len, dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RotaryTable {
    len: usize,
    dim: usize,
    cos: Vec<f32>,
    sin: Vec<f32>,
}

impl RotaryTable {
    /// Build tables for positions `0..len`. `dim` must be even.
    pub fn build(dim: usize, len: usize, base: f32) -> Result<Self> {
        if dim % 2 != 0 {
            return Err(StreamError::shape("rotary table dim", "even", dim));
        }
        let half = dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1.0 / base.powf((2 * i) as f32 / dim as f32))
            .collect();

        let mut cos = Vec::with_capacity(len * dim);
        let mut sin = Vec::with_capacity(len * dim);
        for pos in 0..len {
            let pos = pos as f32;
            // emb = cat(freqs, freqs)
            for _ in 0..2 {
                for &freq in &inv_freq {
                    let (s, c) = (pos * freq).sin_cos();
                    cos.push(c);
                    sin.push(s);
                }
            }
        }
        Ok(RotaryTable { len, dim, cos, sin })
    }

    /// Number of positions covered.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn cos_row(&self, pos: usize) -> &[f32] {
        &self.cos[pos * self.dim..(pos + 1) * self.dim]
    }

    #[inline]
    pub fn sin_row(&self, pos: usize) -> &[f32] {
        &self.sin[pos * self.dim..(pos + 1) * self.dim]
    }
}

/// Rotary table provider, aligned with GPTNeoXRotaryEmbedding.
///
/// Holds a table for `max_position_embeddings` positions. Longer requests get
/// a freshly built table for that call instead of mutating the shared one.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    base: f32,
    cached: RotaryTable,
}

impl RotaryEmbedding {
    pub fn new(dim: usize, max_position_embeddings: usize, base: f32) -> Result<Self> {
        Ok(RotaryEmbedding {
            base,
            cached: RotaryTable::build(dim, max_position_embeddings, base)?,
        })
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.cached.dim
    }

    /// Table covering at least `seq_len` positions.
    pub fn table(&self, seq_len: usize) -> Result<Cow<'_, RotaryTable>> {
        if seq_len <= self.cached.len {
            Ok(Cow::Borrowed(&self.cached))
        } else {
            tracing::debug!(
                seq_len,
                cached = self.cached.len,
                "rebuilding rotary table past cached length"
            );
            RotaryTable::build(self.cached.dim, seq_len, self.base).map(Cow::Owned)
        }
    }
}

/// Rotate half the hidden dims: `concat(-x2, x1)` over the last axis.
pub fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let dim = x.last_dim();
    if dim % 2 != 0 {
        return Err(StreamError::shape("rotate_half", "even last dim", dim));
    }
    let half = dim / 2;
    let mut out = Tensor::zeros(x.shape());
    if dim == 0 {
        return Ok(out);
    }
    for (dst, src) in out.data_mut().chunks_mut(dim).zip(x.data().chunks(dim)) {
        rotate_half_row(dst, src, half);
    }
    Ok(out)
}

#[inline]
fn rotate_half_row(dst: &mut [f32], src: &[f32], half: usize) {
    for i in 0..half {
        dst[i] = -src[i + half];
        dst[i + half] = src[i];
    }
}

/// Apply rotary embeddings to `x` `[batch, heads, seq, dim]` using the table
/// rows selected by `position_ids` `[batch or 1, seq]`:
/// `x * cos[p] + rotate_half(x) * sin[p]`.
pub fn apply_rotary_pos_emb_single(
    x: &Tensor,
    table: &RotaryTable,
    position_ids: &PositionIds,
) -> Result<Tensor> {
    let (batch, heads, seq, dim) = x.dims4()?;
    if dim % 2 != 0 {
        return Err(StreamError::shape("rotary dim", "even", dim));
    }
    if dim != table.dim() {
        return Err(StreamError::shape("rotary dim", table.dim(), dim));
    }
    if position_ids.seq() != seq || (position_ids.batch() != 1 && position_ids.batch() != batch) {
        return Err(StreamError::shape(
            "position ids",
            [batch, seq],
            [position_ids.batch(), position_ids.seq()],
        ));
    }
    if let Some(&position) = position_ids.as_slice().iter().find(|&&p| p >= table.len()) {
        return Err(StreamError::PositionOutOfRange {
            position,
            len: table.len(),
        });
    }

    let half = dim / 2;
    let mut out = Tensor::zeros(x.shape());
    if seq * dim == 0 {
        return Ok(out);
    }
    out.data_mut()
        .par_chunks_mut(seq * dim)
        .zip(x.data().par_chunks(seq * dim))
        .enumerate()
        .for_each(|(bh, (dst, src))| {
            let ids = position_ids.row(bh / heads);
            let mut rotated = vec![0.0f32; dim];
            for (s, &pos) in ids.iter().enumerate() {
                let xs = &src[s * dim..(s + 1) * dim];
                rotate_half_row(&mut rotated, xs, half);
                let cos = table.cos_row(pos);
                let sin = table.sin_row(pos);
                for (i, d) in dst[s * dim..(s + 1) * dim].iter_mut().enumerate() {
                    *d = xs[i] * cos[i] + rotated[i] * sin[i];
                }
            }
        });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(lhs: f32, rhs: f32, tol: f32) {
        assert!(
            (lhs - rhs).abs() <= tol,
            "expected {lhs} ~= {rhs} (tol={tol}), diff={}",
            (lhs - rhs).abs()
        );
    }

    fn arange(shape: &[usize]) -> Tensor {
        let n = shape.iter().product::<usize>();
        Tensor::new((0..n).map(|v| v as f32 * 0.1).collect(), shape).unwrap()
    }

    #[test]
    fn table_rows_repeat_frequencies() {
        let table = RotaryTable::build(4, 2, 10000.0).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.cos_row(0), &[1.0; 4]);
        assert_eq!(table.sin_row(0), &[0.0; 4]);
        let sin1 = table.sin_row(1);
        approx_eq(sin1[0], 1.0f32.sin(), 1e-6);
        approx_eq(sin1[1], 0.01f32.sin(), 1e-6);
        assert_eq!(sin1[0], sin1[2]);
        assert_eq!(sin1[1], sin1[3]);
    }

    #[test]
    fn provider_extends_past_cached_length() {
        let rope = RotaryEmbedding::new(4, 3, 10000.0).unwrap();
        assert!(matches!(rope.table(3).unwrap(), Cow::Borrowed(_)));
        let long = rope.table(7).unwrap();
        assert!(matches!(long, Cow::Owned(_)));
        assert_eq!(long.len(), 7);
        assert_eq!(long.cos_row(2), rope.table(3).unwrap().cos_row(2));
    }

    #[test]
    fn rotate_half_matches_definition() {
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], &[1, 4]).unwrap();
        assert_eq!(rotate_half(&x).unwrap().data(), &[-3.0, -4.0, 1.0, 2.0]);
        let odd = Tensor::zeros(&[1, 3]);
        assert!(rotate_half(&odd).is_err());
    }

    #[test]
    fn position_zero_is_identity() {
        let x = arange(&[1, 2, 3, 4]);
        let table = RotaryTable::build(4, 8, 10000.0).unwrap();
        let ids = PositionIds::new(vec![0, 0, 0], 1, 3).unwrap();
        assert_eq!(apply_rotary_pos_emb_single(&x, &table, &ids).unwrap(), x);
    }

    #[test]
    fn rotation_preserves_pair_norms() {
        let x = arange(&[1, 1, 1, 4]);
        let table = RotaryTable::build(4, 8, 10000.0).unwrap();
        let ids = PositionIds::new(vec![5], 1, 1).unwrap();
        let y = apply_rotary_pos_emb_single(&x, &table, &ids).unwrap();
        let (xs, ys) = (x.data(), y.data());
        for i in 0..2 {
            approx_eq(
                xs[i].hypot(xs[i + 2]),
                ys[i].hypot(ys[i + 2]),
                1e-5,
            );
        }
    }

    #[test]
    fn each_batch_element_uses_its_own_ids() {
        let single = arange(&[1, 1, 2, 4]);
        let x = Tensor::cat(&[&single, &single], 0).unwrap();
        let table = RotaryTable::build(4, 8, 10000.0).unwrap();
        let ids = PositionIds::new(vec![1, 2, 6, 7], 2, 2).unwrap();
        let y = apply_rotary_pos_emb_single(&x, &table, &ids).unwrap();

        let first = PositionIds::new(vec![1, 2], 1, 2).unwrap();
        let second = PositionIds::new(vec![6, 7], 1, 2).unwrap();
        let y0 = apply_rotary_pos_emb_single(&single, &table, &first).unwrap();
        let y1 = apply_rotary_pos_emb_single(&single, &table, &second).unwrap();
        assert_eq!(y.narrow(0, 0, 1).unwrap(), y0);
        assert_eq!(y.narrow(0, 1, 1).unwrap(), y1);
    }

    #[test]
    fn out_of_range_position_is_rejected() {
        let x = arange(&[1, 1, 1, 4]);
        let table = RotaryTable::build(4, 4, 10000.0).unwrap();
        let ids = PositionIds::new(vec![4], 1, 1).unwrap();
        assert!(matches!(
            apply_rotary_pos_emb_single(&x, &table, &ids),
            Err(StreamError::PositionOutOfRange { position: 4, len: 4 })
        ));
    }

    #[test]
    fn rotary_dim_mismatch_is_rejected() {
        let x = arange(&[1, 1, 1, 6]);
        let table = RotaryTable::build(4, 4, 10000.0).unwrap();
        let ids = PositionIds::new(vec![0], 1, 1).unwrap();
        assert!(matches!(
            apply_rotary_pos_emb_single(&x, &table, &ids),
            Err(StreamError::Shape { .. })
        ));
    }

    #[test]
    fn odd_rotary_dim_is_an_error_not_a_panic() {
        assert!(matches!(
            RotaryTable::build(3, 4, 10000.0),
            Err(StreamError::Shape { .. })
        ));
        assert!(RotaryEmbedding::new(5, 4, 10000.0).is_err());

        let x = arange(&[1, 1, 1, 3]);
        let table = RotaryTable::build(4, 4, 10000.0).unwrap();
        let ids = PositionIds::new(vec![3], 1, 1).unwrap();
        assert!(matches!(
            apply_rotary_pos_emb_single(&x, &table, &ids),
            Err(StreamError::Shape { context: "rotary dim", .. })
        ));
    }
}
