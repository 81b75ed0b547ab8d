//! Per-session streaming state carried across forward calls.

use crate::cache::{LayerPast, StartRecentCache};
use crate::config::StreamingConfig;
use crate::error::Result;
use crate::model::NeoXModel;
use crate::tensor::{PositionIds, Tensor};

/// Key/value caches of one generation session plus the eviction policy.
///
/// Query positions are assigned by cache slot: new tokens get
/// `cache_len..cache_len + new_len` after eviction has made room.
#[derive(Debug, Clone)]
pub struct StreamingSession {
    /// One cache per layer (past_key_values)
    past: Option<Vec<LayerPast>>,
    kv_cache: StartRecentCache,
    /// Tokens processed since the last reset
    tokens_seen: usize,
}

impl StreamingSession {
    pub fn new(config: StreamingConfig) -> Result<Self> {
        Ok(StreamingSession {
            past: None,
            kv_cache: StartRecentCache::new(config)?,
            tokens_seen: 0,
        })
    }

    /// Resident cache slots (same for every layer).
    pub fn cache_len(&self) -> usize {
        self.past
            .as_ref()
            .and_then(|p| p.first())
            .map_or(0, LayerPast::seq_len)
    }

    #[inline]
    pub fn tokens_seen(&self) -> usize {
        self.tokens_seen
    }

    pub fn past(&self) -> Option<&[LayerPast]> {
        self.past.as_deref()
    }

    /// Drop all cached state.
    pub fn reset(&mut self) {
        self.past = None;
        self.tokens_seen = 0;
    }

    /// Run `hidden_states` `[batch, new_len, hidden]` through the model,
    /// evicting first so the cache never exceeds its window.
    pub fn step(&mut self, model: &NeoXModel, hidden_states: &Tensor) -> Result<Tensor> {
        let (batch, new_len, _) = hidden_states.dims3()?;

        // Session state changes only once the forward pass succeeds.
        let past = match self.past.as_deref() {
            Some(p) => Some(self.kv_cache.evict_for_space(p, new_len)?),
            None => None,
        };
        let cache_len = past
            .as_ref()
            .and_then(|p| p.first())
            .map_or(0, LayerPast::seq_len);
        let position_ids = PositionIds::contiguous(batch, cache_len, new_len);

        let out = model.forward(hidden_states, &position_ids, None, past.as_deref(), true)?;
        self.past = out.presents;
        self.tokens_seen += new_len;
        tracing::debug!(
            tokens_seen = self.tokens_seen,
            cache_len = self.cache_len(),
            "session step"
        );
        Ok(out.last_hidden_state)
    }
}
