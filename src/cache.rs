//! Per-layer key/value cache and start+recent eviction.

use crate::config::StreamingConfig;
use crate::error::{Result, StreamError};
use crate::tensor::Tensor;

/// Sequence axis of cached `[batch, heads, seq, head_dim]` tensors.
pub const SEQ_AXIS: usize = 2;

/// Cached keys and values for one attention layer (layer_past / present).
#[derive(Debug, Clone, PartialEq)]
pub struct LayerPast {
    /// Cached keys `[batch, heads, cached_len, head_dim]`
    pub keys: Tensor,
    /// Cached values `[batch, heads, cached_len, head_dim]`
    pub values: Tensor,
}

impl LayerPast {
    pub fn new(keys: Tensor, values: Tensor) -> Result<Self> {
        let kd = keys.dims4()?;
        let vd = values.dims4()?;
        if (kd.0, kd.1, kd.2) != (vd.0, vd.1, vd.2) {
            return Err(StreamError::shape("LayerPast", keys.shape(), values.shape()));
        }
        Ok(LayerPast { keys, values })
    }

    /// Number of cached slots.
    #[inline]
    pub fn seq_len(&self) -> usize {
        self.keys.shape()[SEQ_AXIS]
    }

    /// Keep the slots in `[0, start)` and `[end, seq_len)`.
    fn keep_outside(&self, start: usize, end: usize) -> Result<LayerPast> {
        let len = self.seq_len();
        let keep = |t: &Tensor| -> Result<Tensor> {
            let head = t.narrow(SEQ_AXIS, 0, start)?;
            let tail = t.narrow(SEQ_AXIS, end, len - end)?;
            Tensor::cat(&[&head, &tail], SEQ_AXIS)
        };
        Ok(LayerPast {
            keys: keep(&self.keys)?,
            values: keep(&self.values)?,
        })
    }
}

/// Concatenate new keys/values onto the past along the sequence axis.
///
/// Returns `(k, v)` unchanged when there is no past. Inputs are never mutated
/// and nothing is evicted.
pub fn integrate(past: Option<&LayerPast>, keys: Tensor, values: Tensor) -> Result<LayerPast> {
    let Some(past) = past else {
        return LayerPast::new(keys, values);
    };
    let (pb, ph, _, pd) = past.keys.dims4()?;
    let (b, h, _, d) = keys.dims4()?;
    if (pb, ph, pd) != (b, h, d) {
        return Err(StreamError::shape(
            "layer_past keys",
            past.keys.shape(),
            keys.shape(),
        ));
    }
    LayerPast::new(
        Tensor::cat(&[&past.keys, &keys], SEQ_AXIS)?,
        Tensor::cat(&[&past.values, &values], SEQ_AXIS)?,
    )
}

/// Keeps a fixed prefix of "attention sink" slots plus the most recent slots.
#[derive(Debug, Clone, Copy)]
pub struct StartRecentCache {
    start_size: usize,
    recent_size: usize,
}

impl StartRecentCache {
    pub fn new(config: StreamingConfig) -> Result<Self> {
        config.validate()?;
        Ok(StartRecentCache {
            start_size: config.start_size,
            recent_size: config.recent_size,
        })
    }

    /// Maximum number of resident slots.
    #[inline]
    pub fn cache_size(&self) -> usize {
        self.start_size + self.recent_size
    }

    /// Trim every layer back to `start + recent` slots once it overflows.
    pub fn evict(&self, past: &[LayerPast]) -> Result<Vec<LayerPast>> {
        past.iter()
            .map(|layer| {
                let len = layer.seq_len();
                if len <= self.cache_size() {
                    return Ok(layer.clone());
                }
                layer.keep_outside(self.start_size, len - self.recent_size)
            })
            .collect()
    }

    /// Make room for `num_coming` new slots so the total stays within the cache size.
    pub fn evict_for_space(&self, past: &[LayerPast], num_coming: usize) -> Result<Vec<LayerPast>> {
        past.iter()
            .map(|layer| {
                let len = layer.seq_len();
                if len + num_coming <= self.cache_size() {
                    return Ok(layer.clone());
                }
                let keep_recent = self.recent_size.saturating_sub(num_coming);
                let start = self.start_size.min(len);
                let end = len.saturating_sub(keep_recent).max(start);
                tracing::debug!(len, num_coming, evicted = end - start, "evicting for space");
                layer.keep_outside(start, end)
            })
            .collect()
    }

    /// Drop slots `[start, end)` from every layer.
    pub fn evict_range(
        &self,
        past: &[LayerPast],
        start: usize,
        end: usize,
    ) -> Result<Vec<LayerPast>> {
        past.iter()
            .map(|layer| {
                let len = layer.seq_len();
                if start > end || end > len {
                    return Err(StreamError::shape(
                        "evict_range",
                        format!("start <= end <= {len}"),
                        start..end,
                    ));
                }
                layer.keep_outside(start, end)
            })
            .collect()
    }
}
