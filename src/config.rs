//! GPT-NeoX model and streaming configuration.

use crate::error::{Result, StreamError};

/// Transformer hyperparameters, aligned with GPTNeoXConfig in Hugging Face Transformers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeoXConfig {
    /// Transformer embedding dimension (hidden_size)
    pub hidden_size: i32,
    /// MLP intermediate dimension (intermediate_size)
    pub intermediate_size: i32,
    /// Number of decoder layers (num_hidden_layers)
    pub num_hidden_layers: i32,
    /// Number of attention heads (num_attention_heads)
    pub num_attention_heads: i32,
    /// Rotary table length built up front (max_position_embeddings)
    pub max_position_embeddings: i32,
    /// Fraction of each head that receives rotary embeddings (rotary_pct)
    pub rotary_pct: f32,
    /// Rotary frequency base (rotary_emb_base)
    pub rotary_emb_base: f32,
    /// LayerNorm epsilon (layer_norm_eps)
    pub layer_norm_eps: f32,
    /// Attention and MLP read the same residual input (use_parallel_residual)
    pub use_parallel_residual: bool,
}

impl Default for NeoXConfig {
    /// A pythia-70m shaped config.
    fn default() -> Self {
        NeoXConfig {
            hidden_size: 512,
            intermediate_size: 2048,
            num_hidden_layers: 6,
            num_attention_heads: 8,
            max_position_embeddings: 2048,
            rotary_pct: 0.25,
            rotary_emb_base: 10000.0,
            layer_norm_eps: 1e-5,
            use_parallel_residual: true,
        }
    }
}

impl NeoXConfig {
    /// Returns the head size.
    #[inline]
    pub fn head_size(&self) -> usize {
        (self.hidden_size / self.num_attention_heads) as usize
    }

    /// Returns the number of rotated dimensions per head (rotary_ndims).
    #[inline]
    pub fn rotary_ndims(&self) -> usize {
        (self.head_size() as f32 * self.rotary_pct) as usize
    }

    /// Check that the hyperparameters describe a buildable model.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_hidden_layers", self.num_hidden_layers),
            ("num_attention_heads", self.num_attention_heads),
            ("max_position_embeddings", self.max_position_embeddings),
        ];
        for (name, value) in positive {
            if value <= 0 {
                return Err(StreamError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(StreamError::InvalidConfig(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        let rotary = self.rotary_ndims();
        if rotary == 0 || rotary % 2 != 0 {
            return Err(StreamError::InvalidConfig(format!(
                "rotary_ndims must be even and non-zero, got {rotary}"
            )));
        }
        if rotary > self.head_size() {
            return Err(StreamError::InvalidConfig(format!(
                "rotary_ndims {rotary} exceeds head_size {}",
                self.head_size()
            )));
        }
        if !(self.rotary_emb_base.is_finite() && self.rotary_emb_base > 0.0) {
            return Err(StreamError::InvalidConfig(format!(
                "rotary_emb_base must be finite and positive, got {}",
                self.rotary_emb_base
            )));
        }
        Ok(())
    }
}

/// How an attention layer assigns rotary positions to cached keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttentionStrategy {
    /// Stock GPT-NeoX: keys are rotated once at their absolute position and
    /// cached already rotated.
    #[default]
    Default,
    /// Keys are cached un-rotated and re-rotated by cache slot index on every
    /// call, so evicting slots keeps positions contiguous.
    PositionShifted,
}

/// Window sizes for the start+recent eviction cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingConfig {
    /// Leading "attention sink" slots that are never evicted.
    pub start_size: usize,
    /// Most recent slots kept behind the sink.
    pub recent_size: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        StreamingConfig {
            start_size: 4,
            recent_size: 2000,
        }
    }
}

impl StreamingConfig {
    /// Total number of resident slots.
    #[inline]
    pub fn cache_size(&self) -> usize {
        self.start_size + self.recent_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_size() == 0 {
            return Err(StreamError::InvalidConfig(
                "start_size + recent_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
