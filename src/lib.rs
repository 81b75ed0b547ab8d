//! Streaming GPT-NeoX attention in Rust
//!
//! Position-shifted rotary attention for GPT-NeoX style models: cached keys
//! are rotated by their slot in a bounded key/value cache rather than by
//! their index in the full stream, so an attention-sink eviction policy can
//! serve an unbounded token stream with a fixed-size cache.

pub mod attention;
pub mod cache;
pub mod config;
pub mod error;
pub mod layers;
pub mod model;
pub mod module;
pub mod ops;
pub mod rotary;
pub mod state;
pub mod tensor;
pub mod weights;

pub use attention::{AttentionInput, AttentionOutput, NeoXAttention, shifted_key_position_ids};
pub use cache::{LayerPast, StartRecentCache, integrate};
pub use config::{AttentionStrategy, NeoXConfig, StreamingConfig};
pub use error::{Result, StreamError};
pub use model::{
    ModelOutput, NeoXLayer, NeoXModel, load_model, read_model, save_model, write_model,
};
pub use module::{Module, enable_pos_shift_attention, set_attention_strategy};
pub use rotary::{RotaryEmbedding, RotaryTable, apply_rotary_pos_emb_single, rotate_half};
pub use state::StreamingSession;
pub use tensor::{PositionIds, Tensor};
pub use weights::{NeoXLayerWeights, NeoXWeights};
