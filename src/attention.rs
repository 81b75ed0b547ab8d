//! Self-attention for one GPT-NeoX layer, with selectable key positioning.
//!
//! With [`AttentionStrategy::PositionShifted`] the cache holds un-rotated keys
//! and every call re-rotates the whole concatenated key tensor by slot index
//! `0..seq_len`. Queries are rotated by the caller's position ids, which the
//! session assigns as cache slots too. Evicting slots therefore never leaves a
//! gap in the positions the scores see, however long the stream runs.

use rayon::prelude::*;

use crate::cache::{LayerPast, integrate};
use crate::config::{AttentionStrategy, NeoXConfig};
use crate::error::{Result, StreamError};
use crate::layers::Linear;
use crate::module::Module;
use crate::ops::softmax;
use crate::rotary::{RotaryEmbedding, RotaryTable, apply_rotary_pos_emb_single};
use crate::tensor::{PositionIds, Tensor};

/// Arguments of one attention call.
#[derive(Debug, Clone, Copy)]
pub struct AttentionInput<'a> {
    /// `[batch, seq, hidden]`
    pub hidden_states: &'a Tensor,
    /// Positions of the new tokens, `[batch or 1, seq]`
    pub position_ids: &'a PositionIds,
    /// Additive mask broadcastable to `[batch, heads, seq, cached + seq]`
    pub attention_mask: Option<&'a Tensor>,
    /// Multiplicative mask on attention weights, same broadcasting
    pub head_mask: Option<&'a Tensor>,
    pub layer_past: Option<&'a LayerPast>,
    pub use_cache: bool,
    pub output_attentions: bool,
}

impl<'a> AttentionInput<'a> {
    pub fn new(hidden_states: &'a Tensor, position_ids: &'a PositionIds) -> Self {
        AttentionInput {
            hidden_states,
            position_ids,
            attention_mask: None,
            head_mask: None,
            layer_past: None,
            use_cache: false,
            output_attentions: false,
        }
    }

    pub fn with_attention_mask(mut self, mask: Option<&'a Tensor>) -> Self {
        self.attention_mask = mask;
        self
    }

    pub fn with_head_mask(mut self, mask: Option<&'a Tensor>) -> Self {
        self.head_mask = mask;
        self
    }

    pub fn with_layer_past(mut self, past: Option<&'a LayerPast>) -> Self {
        self.layer_past = past;
        self
    }

    pub fn with_use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_output_attentions(mut self, output_attentions: bool) -> Self {
        self.output_attentions = output_attentions;
        self
    }
}

/// Result of one attention call.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// `[batch, seq, hidden]`
    pub attn_output: Tensor,
    /// Cache to pass back as `layer_past`, when `use_cache` was set
    pub present: Option<LayerPast>,
    /// `[batch, heads, seq, cached + seq]`, when `output_attentions` was set
    pub attn_weights: Option<Tensor>,
}

/// Key position ids used by position-shifted attention: one run `0..seq_len`
/// shared by every batch element.
pub fn shifted_key_position_ids(seq_len: usize) -> PositionIds {
    PositionIds::contiguous(1, 0, seq_len)
}

/// Aligned with GPTNeoXAttention.
#[derive(Debug, Clone)]
pub struct NeoXAttention {
    num_heads: usize,
    head_size: usize,
    rotary_ndims: usize,
    query_key_value: Linear,
    dense: Linear,
    rotary_emb: RotaryEmbedding,
    strategy: AttentionStrategy,
}

impl NeoXAttention {
    pub fn new(
        config: &NeoXConfig,
        query_key_value: Linear,
        dense: Linear,
        strategy: AttentionStrategy,
    ) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_size as usize;
        if query_key_value.out_features() != 3 * hidden {
            return Err(StreamError::shape(
                "query_key_value",
                3 * hidden,
                query_key_value.out_features(),
            ));
        }
        if dense.out_features() != hidden {
            return Err(StreamError::shape("dense", hidden, dense.out_features()));
        }
        let rotary_ndims = config.rotary_ndims();
        Ok(NeoXAttention {
            num_heads: config.num_attention_heads as usize,
            head_size: config.head_size(),
            rotary_ndims,
            query_key_value,
            dense,
            rotary_emb: RotaryEmbedding::new(
                rotary_ndims,
                config.max_position_embeddings as usize,
                config.rotary_emb_base,
            )?,
            strategy,
        })
    }

    #[inline]
    pub fn strategy(&self) -> AttentionStrategy {
        self.strategy
    }

    #[inline]
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    #[inline]
    pub fn head_size(&self) -> usize {
        self.head_size
    }

    #[inline]
    pub fn rotary_ndims(&self) -> usize {
        self.rotary_ndims
    }

    /// Attention forward step, aligned with GPTNeoXAttention.forward.
    pub fn forward(&self, input: &AttentionInput<'_>) -> Result<AttentionOutput> {
        let (batch, new_len, hidden) = input.hidden_states.dims3()?;
        if hidden != self.num_heads * self.head_size {
            return Err(StreamError::shape(
                "hidden_states",
                self.num_heads * self.head_size,
                hidden,
            ));
        }
        let cached_len = input.layer_past.map_or(0, LayerPast::seq_len);
        let seq_len = new_len + cached_len;
        tracing::debug!(strategy = ?self.strategy, new_len, cached_len, "attention forward");

        // [batch, seq, heads * 3 * head_size] --> 3 x [batch, heads, seq, head_size]
        let qkv = self.query_key_value.forward(input.hidden_states)?;
        let (query, key, value) = self.split_heads(&qkv, batch, new_len);

        // One table for queries and keys.
        let table = self.rotary_emb.table(seq_len)?;
        let query = self.rotate(&query, &table, input.position_ids)?;

        let (past, rotated_keys) = match self.strategy {
            AttentionStrategy::PositionShifted => {
                // Cache raw keys; rotate the whole cache by slot index.
                let past = integrate(input.layer_past, key, value)?;
                let key_ids = shifted_key_position_ids(seq_len);
                let rotated = self.rotate(&past.keys, &table, &key_ids)?;
                (past, Some(rotated))
            }
            AttentionStrategy::Default => {
                let key = self.rotate(&key, &table, input.position_ids)?;
                (integrate(input.layer_past, key, value)?, None)
            }
        };
        let keys = rotated_keys.as_ref().unwrap_or(&past.keys);

        let (context, attn_weights) = attend(&query, keys, &past.values, input)?;

        let merged = self.merge_heads(&context, batch, new_len)?;
        let attn_output = self.dense.forward(&merged)?;

        Ok(AttentionOutput {
            attn_output,
            present: input.use_cache.then_some(past),
            attn_weights: if input.output_attentions {
                Some(attn_weights)
            } else {
                None
            },
        })
    }

    /// Rotate the first `rotary_ndims` of each head and keep the rest as is.
    fn rotate(&self, x: &Tensor, table: &RotaryTable, ids: &PositionIds) -> Result<Tensor> {
        let (rot, pass) = x.split_last(self.rotary_ndims)?;
        let rot = apply_rotary_pos_emb_single(&rot, table, ids)?;
        Tensor::cat(&[&rot, &pass], 3)
    }

    /// `[batch, seq, heads, 3 * head_size]` into query, key, value
    /// `[batch, heads, seq, head_size]`.
    fn split_heads(&self, qkv: &Tensor, batch: usize, seq: usize) -> (Tensor, Tensor, Tensor) {
        let (heads, d) = (self.num_heads, self.head_size);
        let shape = [batch, heads, seq, d];
        let mut parts = [
            Tensor::zeros(&shape),
            Tensor::zeros(&shape),
            Tensor::zeros(&shape),
        ];
        let src = qkv.data();
        for b in 0..batch {
            for s in 0..seq {
                for h in 0..heads {
                    let src_off = ((b * seq + s) * heads + h) * 3 * d;
                    let dst_off = ((b * heads + h) * seq + s) * d;
                    for (p, part) in parts.iter_mut().enumerate() {
                        part.data_mut()[dst_off..dst_off + d]
                            .copy_from_slice(&src[src_off + p * d..src_off + (p + 1) * d]);
                    }
                }
            }
        }
        let [q, k, v] = parts;
        (q, k, v)
    }

    /// `[batch, heads, seq, head_size]` into `[batch, seq, heads * head_size]`.
    fn merge_heads(&self, x: &Tensor, batch: usize, seq: usize) -> Result<Tensor> {
        let (heads, d) = (self.num_heads, self.head_size);
        let mut out = vec![0.0f32; batch * seq * heads * d];
        let src = x.data();
        for b in 0..batch {
            for h in 0..heads {
                for s in 0..seq {
                    let src_off = ((b * heads + h) * seq + s) * d;
                    let dst_off = ((b * seq + s) * heads + h) * d;
                    out[dst_off..dst_off + d].copy_from_slice(&src[src_off..src_off + d]);
                }
            }
        }
        Tensor::new(out, &[batch, seq, heads * d])
    }
}

/// Read-only view of a mask broadcast to `[batch, heads, q_len, k_len]`.
struct Broadcast<'a> {
    data: &'a [f32],
    strides: [usize; 4],
}

impl<'a> Broadcast<'a> {
    fn new(mask: &'a Tensor, target: [usize; 4], context: &'static str) -> Result<Self> {
        let (a, b, c, d) = mask.dims4()?;
        let dims = [a, b, c, d];
        if dims.iter().zip(&target).any(|(&m, &t)| m != 1 && m != t) {
            return Err(StreamError::shape(context, target, dims));
        }
        let mut strides = [0usize; 4];
        let mut acc = 1;
        for i in (0..4).rev() {
            strides[i] = if dims[i] == 1 { 0 } else { acc };
            acc *= dims[i];
        }
        Ok(Broadcast {
            data: mask.data(),
            strides,
        })
    }

    #[inline]
    fn at(&self, idx: [usize; 4]) -> f32 {
        let off: usize = idx.iter().zip(&self.strides).map(|(i, s)| i * s).sum();
        self.data[off]
    }
}

/// Scaled dot-product attention with a built-in causal mask, aligned with
/// GPTNeoXAttention._attn. Returns the per-head context and the weights.
fn attend(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    input: &AttentionInput<'_>,
) -> Result<(Tensor, Tensor)> {
    let (batch, heads, q_len, d) = query.dims4()?;
    let (kb, kh, k_len, kd) = key.dims4()?;
    if (kb, kh, kd) != (batch, heads, d) || value.shape() != key.shape() {
        return Err(StreamError::shape("key/value", query.shape(), key.shape()));
    }
    if k_len < q_len {
        return Err(StreamError::shape("key length", format!(">= {q_len}"), k_len));
    }
    let target = [batch, heads, q_len, k_len];
    let attention_mask = input
        .attention_mask
        .map(|m| Broadcast::new(m, target, "attention_mask"))
        .transpose()?;
    let head_mask = input
        .head_mask
        .map(|m| Broadcast::new(m, target, "head_mask"))
        .transpose()?;

    let mut context = Tensor::zeros(&[batch, heads, q_len, d]);
    let mut weights = Tensor::zeros(&target);
    if q_len == 0 || k_len == 0 {
        return Ok((context, weights));
    }

    let scale = 1.0 / (d as f32).sqrt();
    let past_len = k_len - q_len;
    let (qd, kd, vd) = (query.data(), key.data(), value.data());

    context
        .data_mut()
        .par_chunks_mut(q_len * d)
        .zip(weights.data_mut().par_chunks_mut(q_len * k_len))
        .enumerate()
        .for_each(|(bh, (ctx, att))| {
            let (b, h) = (bh / heads, bh % heads);
            let qh = &qd[bh * q_len * d..(bh + 1) * q_len * d];
            let kh = &kd[bh * k_len * d..(bh + 1) * k_len * d];
            let vh = &vd[bh * k_len * d..(bh + 1) * k_len * d];

            for i in 0..q_len {
                let q = &qh[i * d..(i + 1) * d];
                let row = &mut att[i * k_len..(i + 1) * k_len];

                // Compute attention scores
                for (j, score) in row.iter_mut().enumerate() {
                    *score = if j > past_len + i {
                        f32::NEG_INFINITY
                    } else {
                        let k = &kh[j * d..(j + 1) * d];
                        q.iter().zip(k).map(|(x, y)| x * y).sum::<f32>() * scale
                    };
                    if let Some(mask) = &attention_mask {
                        *score += mask.at([b, h, i, j]);
                    }
                }

                softmax(row);

                if let Some(mask) = &head_mask {
                    for (j, w) in row.iter_mut().enumerate() {
                        *w *= mask.at([b, h, i, j]);
                    }
                }

                // Weighted sum of values
                let out = &mut ctx[i * d..(i + 1) * d];
                for (j, &a) in row.iter().enumerate() {
                    let v = &vh[j * d..(j + 1) * d];
                    for (o, &vv) in out.iter_mut().zip(v) {
                        *o += a * vv;
                    }
                }
            }
        });

    Ok((context, weights))
}

impl Module for NeoXAttention {
    fn name(&self) -> &'static str {
        "GPTNeoXAttention"
    }

    fn children_mut(&mut self) -> Vec<&mut dyn Module> {
        vec![
            &mut self.query_key_value as &mut dyn Module,
            &mut self.dense as &mut dyn Module,
        ]
    }

    fn attention_strategy_mut(&mut self) -> Option<&mut AttentionStrategy> {
        Some(&mut self.strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// batch 1, heads 2, head_size 4, fully rotary.
    fn config() -> NeoXConfig {
        NeoXConfig {
            hidden_size: 8,
            intermediate_size: 16,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            max_position_embeddings: 32,
            rotary_pct: 1.0,
            ..NeoXConfig::default()
        }
    }

    fn ramp(n: usize, scale: f32) -> Vec<f32> {
        (0..n).map(|i| ((i * 7 % 13) as f32 - 6.0) * scale).collect()
    }

    fn attention(strategy: AttentionStrategy) -> NeoXAttention {
        let qkv = Linear::new(ramp(24 * 8, 0.05), Some(ramp(24, 0.01)), 8, 24).unwrap();
        let dense = Linear::new(ramp(64, 0.1), None, 8, 8).unwrap();
        NeoXAttention::new(&config(), qkv, dense, strategy).unwrap()
    }

    fn hidden(seq: usize, offset: usize) -> Tensor {
        let data = (0..seq * 8)
            .map(|i| (((i + offset * 8) * 5 % 11) as f32 - 5.0) * 0.2)
            .collect();
        Tensor::new(data, &[1, seq, 8]).unwrap()
    }

    #[test]
    fn prefill_then_decode_shapes() {
        let attn = attention(AttentionStrategy::PositionShifted);
        let h = hidden(3, 0);
        let ids = PositionIds::contiguous(1, 0, 3);
        let out = attn
            .forward(&AttentionInput::new(&h, &ids).with_use_cache(true))
            .unwrap();
        assert_eq!(out.attn_output.shape(), &[1, 3, 8]);
        let present = out.present.unwrap();
        assert_eq!(present.keys.shape(), &[1, 2, 3, 4]);
        assert_eq!(present.values.shape(), &[1, 2, 3, 4]);
        assert!(out.attn_weights.is_none());

        let h = hidden(1, 3);
        let ids = PositionIds::contiguous(1, 3, 1);
        let out = attn
            .forward(
                &AttentionInput::new(&h, &ids)
                    .with_layer_past(Some(&present))
                    .with_use_cache(true)
                    .with_output_attentions(true),
            )
            .unwrap();
        assert_eq!(out.attn_output.shape(), &[1, 1, 8]);
        assert_eq!(out.present.unwrap().keys.shape(), &[1, 2, 4, 4]);
        assert_eq!(out.attn_weights.unwrap().shape(), &[1, 2, 1, 4]);
        assert_eq!(shifted_key_position_ids(4).as_slice(), &[0, 1, 2, 3]);
    }

    #[test]
    fn present_is_absent_without_use_cache() {
        let attn = attention(AttentionStrategy::PositionShifted);
        let h = hidden(2, 0);
        let ids = PositionIds::contiguous(1, 0, 2);
        let out = attn.forward(&AttentionInput::new(&h, &ids)).unwrap();
        assert!(out.present.is_none());
    }

    #[test]
    fn shifted_cache_holds_unrotated_keys() {
        let shifted = attention(AttentionStrategy::PositionShifted);
        let default = attention(AttentionStrategy::Default);
        let h = hidden(3, 0);
        let ids = PositionIds::contiguous(1, 0, 3);
        let input = AttentionInput::new(&h, &ids).with_use_cache(true);
        let raw = shifted.forward(&input).unwrap().present.unwrap();
        let rotated = default.forward(&input).unwrap().present.unwrap();

        // Slot 0 is position 0 either way; later slots differ.
        assert_eq!(raw.keys.narrow(2, 0, 1).unwrap(), rotated.keys.narrow(2, 0, 1).unwrap());
        assert_ne!(raw.keys, rotated.keys);
        assert_eq!(raw.values, rotated.values);
    }

    #[test]
    fn causal_rows_sum_to_one_and_hide_the_future() {
        let attn = attention(AttentionStrategy::PositionShifted);
        let h = hidden(3, 0);
        let ids = PositionIds::contiguous(1, 0, 3);
        let out = attn
            .forward(&AttentionInput::new(&h, &ids).with_output_attentions(true))
            .unwrap();
        let w = out.attn_weights.unwrap();
        for row in w.data().chunks(3) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
        // query 0 of head 0 only sees key 0
        assert_eq!(&w.data()[0..3], &[1.0, 0.0, 0.0]);
    }

    #[test]
    fn neg_inf_mask_entry_gets_zero_weight() {
        let attn = attention(AttentionStrategy::PositionShifted);
        let h = hidden(3, 0);
        let ids = PositionIds::contiguous(1, 0, 3);
        let mut mask = vec![0.0f32; 9];
        mask[2 * 3 + 1] = f32::NEG_INFINITY;
        let mask = Tensor::new(mask, &[1, 1, 3, 3]).unwrap();
        let out = attn
            .forward(
                &AttentionInput::new(&h, &ids)
                    .with_attention_mask(Some(&mask))
                    .with_output_attentions(true),
            )
            .unwrap();
        let w = out.attn_weights.unwrap();
        for head in 0..2 {
            let row = &w.data()[head * 9 + 6..head * 9 + 9];
            assert_eq!(row[1], 0.0);
            assert!(row[0] > 0.0 && row[2] > 0.0);
        }
    }

    #[test]
    fn head_mask_silences_a_head() {
        let attn = attention(AttentionStrategy::PositionShifted);
        let h = hidden(2, 0);
        let ids = PositionIds::contiguous(1, 0, 2);
        let head_mask = Tensor::new(vec![1.0, 0.0], &[1, 2, 1, 1]).unwrap();
        let out = attn
            .forward(
                &AttentionInput::new(&h, &ids)
                    .with_head_mask(Some(&head_mask))
                    .with_output_attentions(true),
            )
            .unwrap();
        let w = out.attn_weights.unwrap();
        assert!(w.data()[4..].iter().all(|&v| v == 0.0));
        assert!(w.data()[..4].iter().any(|&v| v > 0.0));
    }

    #[test]
    fn rejects_misshaped_inputs() {
        let attn = attention(AttentionStrategy::PositionShifted);
        let h = hidden(2, 0);
        let wrong_len = PositionIds::contiguous(1, 0, 3);
        assert!(attn.forward(&AttentionInput::new(&h, &wrong_len)).is_err());

        let ids = PositionIds::contiguous(1, 0, 2);
        let bad_mask = Tensor::zeros(&[1, 1, 2, 5]);
        assert!(
            attn.forward(&AttentionInput::new(&h, &ids).with_attention_mask(Some(&bad_mask)))
                .is_err()
        );

        let wide = Tensor::zeros(&[1, 2, 6]);
        assert!(attn.forward(&AttentionInput::new(&wide, &ids)).is_err());
    }

    #[test]
    fn installer_sees_strategy_slot() {
        let mut attn = attention(AttentionStrategy::Default);
        crate::module::enable_pos_shift_attention(&mut attn);
        assert_eq!(attn.strategy(), AttentionStrategy::PositionShifted);
    }

    /// heads 2, head_size 8, only the first 4 lanes of each head rotated.
    fn partial_attention(strategy: AttentionStrategy) -> NeoXAttention {
        let config = NeoXConfig {
            hidden_size: 16,
            rotary_pct: 0.5,
            ..config()
        };
        let qkv = Linear::new(ramp(48 * 16, 0.03), Some(ramp(48, 0.01)), 16, 48).unwrap();
        let dense = Linear::new(ramp(256, 0.05), None, 16, 16).unwrap();
        NeoXAttention::new(&config, qkv, dense, strategy).unwrap()
    }

    fn wide_hidden(seq: usize, offset: usize) -> Tensor {
        let data = (0..seq * 16)
            .map(|i| (((i + offset * 16) * 5 % 11) as f32 - 5.0) * 0.2)
            .collect();
        Tensor::new(data, &[1, seq, 16]).unwrap()
    }

    #[test]
    fn partial_rotary_passes_remaining_lanes_through() {
        let shifted = partial_attention(AttentionStrategy::PositionShifted);
        let default = partial_attention(AttentionStrategy::Default);
        assert_eq!((shifted.head_size(), shifted.rotary_ndims()), (8, 4));

        let h = wide_hidden(3, 0);
        let ids = PositionIds::contiguous(1, 0, 3);
        let input = AttentionInput::new(&h, &ids).with_use_cache(true);
        let raw = shifted.forward(&input).unwrap().present.unwrap().keys;
        let rotated = default.forward(&input).unwrap().present.unwrap().keys;
        assert_eq!(raw.shape(), &[1, 2, 3, 8]);
        assert_eq!(rotated.narrow(3, 4, 4).unwrap(), raw.narrow(3, 4, 4).unwrap());
        assert_ne!(rotated.narrow(3, 0, 4).unwrap(), raw.narrow(3, 0, 4).unwrap());

        let table = shifted.rotary_emb.table(8).unwrap();
        let later = PositionIds::contiguous(1, 2, 3);
        let moved = shifted.rotate(&raw, &table, &later).unwrap();
        assert_eq!(moved.narrow(3, 4, 4).unwrap(), raw.narrow(3, 4, 4).unwrap());
        assert_ne!(moved.narrow(3, 0, 4).unwrap(), raw.narrow(3, 0, 4).unwrap());
    }

    #[test]
    fn partial_rotary_window_matches_fresh_window() {
        use crate::cache::StartRecentCache;
        use crate::config::StreamingConfig;

        let attn = partial_attention(AttentionStrategy::PositionShifted);
        let cache = StartRecentCache::new(StreamingConfig {
            start_size: 0,
            recent_size: 3,
        })
        .unwrap();
        let decode = |token: usize, slot: usize, past: Option<&LayerPast>| {
            let h = wide_hidden(1, token);
            let ids = PositionIds::contiguous(1, slot, 1);
            attn.forward(
                &AttentionInput::new(&h, &ids)
                    .with_layer_past(past)
                    .with_use_cache(true)
                    .with_output_attentions(true),
            )
            .unwrap()
        };

        let mut past: Option<LayerPast> = None;
        for t in 0..10 {
            if let Some(p) = past.take() {
                past = Some(cache.evict_for_space(&[p], 1).unwrap().remove(0));
            }
            let slot = past.as_ref().map_or(0, LayerPast::seq_len);
            let out = decode(t, slot, past.as_ref());

            if t >= 2 {
                let mut fresh: Option<LayerPast> = None;
                let mut expected = None;
                for (pos, token) in (t - 2..=t).enumerate() {
                    let step = decode(token, pos, fresh.as_ref());
                    fresh = step.present.clone();
                    expected = Some(step);
                }
                let expected = expected.unwrap();
                assert_eq!(out.attn_weights, expected.attn_weights, "token {t}");
                assert_eq!(out.attn_output, expected.attn_output, "token {t}");
            }
            past = out.present;
        }
    }
}
