//! GPT-NeoX decoder stack and checkpoint loading.

use crate::attention::{AttentionInput, NeoXAttention};
use crate::cache::LayerPast;
use crate::config::{AttentionStrategy, NeoXConfig};
use crate::error::{Result, StreamError};
use crate::layers::{LayerNorm, Linear, Mlp};
use crate::module::Module;
use crate::ops::accum;
use crate::tensor::{PositionIds, Tensor};
use crate::weights::{NeoXLayerWeights, NeoXWeights};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Load config and weights from a binary checkpoint file.
pub fn load_model<P: AsRef<Path>>(path: P) -> Result<(NeoXConfig, NeoXWeights)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    read_model(&mut reader)
}

/// Write a checkpoint file that `load_model` reads back.
pub fn save_model<P: AsRef<Path>>(
    path: P,
    config: &NeoXConfig,
    weights: &NeoXWeights,
) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_model(&mut writer, config, weights)?;
    writer.flush()?;
    Ok(())
}

/// Read the config header followed by the weights.
pub fn read_model<R: Read>(reader: &mut R) -> Result<(NeoXConfig, NeoXWeights)> {
    let config = NeoXConfig {
        hidden_size: reader.read_i32::<LittleEndian>()?,
        intermediate_size: reader.read_i32::<LittleEndian>()?,
        num_hidden_layers: reader.read_i32::<LittleEndian>()?,
        num_attention_heads: reader.read_i32::<LittleEndian>()?,
        max_position_embeddings: reader.read_i32::<LittleEndian>()?,
        rotary_pct: reader.read_f32::<LittleEndian>()?,
        rotary_emb_base: reader.read_f32::<LittleEndian>()?,
        layer_norm_eps: reader.read_f32::<LittleEndian>()?,
        use_parallel_residual: reader.read_i32::<LittleEndian>()? != 0,
    };
    config
        .validate()
        .map_err(|e| StreamError::InvalidModel(e.to_string()))?;

    let weights = NeoXWeights::load(reader, &config)?;

    Ok((config, weights))
}

/// Write a checkpoint that `read_model` accepts.
pub fn write_model<W: Write>(
    writer: &mut W,
    config: &NeoXConfig,
    weights: &NeoXWeights,
) -> Result<()> {
    writer.write_i32::<LittleEndian>(config.hidden_size)?;
    writer.write_i32::<LittleEndian>(config.intermediate_size)?;
    writer.write_i32::<LittleEndian>(config.num_hidden_layers)?;
    writer.write_i32::<LittleEndian>(config.num_attention_heads)?;
    writer.write_i32::<LittleEndian>(config.max_position_embeddings)?;
    writer.write_f32::<LittleEndian>(config.rotary_pct)?;
    writer.write_f32::<LittleEndian>(config.rotary_emb_base)?;
    writer.write_f32::<LittleEndian>(config.layer_norm_eps)?;
    writer.write_i32::<LittleEndian>(i32::from(config.use_parallel_residual))?;
    weights.write(writer)
}

/// One decoder layer, aligned with GPTNeoXLayer.
#[derive(Debug, Clone)]
pub struct NeoXLayer {
    input_layernorm: LayerNorm,
    post_attention_layernorm: LayerNorm,
    attention: NeoXAttention,
    mlp: Mlp,
    use_parallel_residual: bool,
}

impl NeoXLayer {
    pub fn new(
        config: &NeoXConfig,
        w: NeoXLayerWeights,
        strategy: AttentionStrategy,
    ) -> Result<Self> {
        let h = config.hidden_size as usize;
        let i = config.intermediate_size as usize;
        let eps = config.layer_norm_eps;
        Ok(NeoXLayer {
            input_layernorm: LayerNorm::new(w.input_layernorm_weight, w.input_layernorm_bias, eps)?,
            post_attention_layernorm: LayerNorm::new(
                w.post_attention_layernorm_weight,
                w.post_attention_layernorm_bias,
                eps,
            )?,
            attention: NeoXAttention::new(
                config,
                Linear::new(w.qkv_weight, Some(w.qkv_bias), h, 3 * h)?,
                Linear::new(w.dense_weight, Some(w.dense_bias), h, h)?,
                strategy,
            )?,
            mlp: Mlp::new(
                Linear::new(w.h_to_4h_weight, Some(w.h_to_4h_bias), h, i)?,
                Linear::new(w.four_h_to_h_weight, Some(w.four_h_to_h_bias), i, h)?,
            ),
            use_parallel_residual: config.use_parallel_residual,
        })
    }

    pub fn attention(&self) -> &NeoXAttention {
        &self.attention
    }

    /// Returns the layer output and the attention's `present`.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        position_ids: &PositionIds,
        attention_mask: Option<&Tensor>,
        layer_past: Option<&LayerPast>,
        use_cache: bool,
    ) -> Result<(Tensor, Option<LayerPast>)> {
        let normed = self.input_layernorm.forward(hidden_states)?;
        let attn = self.attention.forward(
            &AttentionInput::new(&normed, position_ids)
                .with_attention_mask(attention_mask)
                .with_layer_past(layer_past)
                .with_use_cache(use_cache),
        )?;

        let mut out = attn.attn_output;
        accum(out.data_mut(), hidden_states.data());
        if self.use_parallel_residual {
            // x + attn(ln1(x)) + mlp(ln2(x))
            let mlp_out = self.mlp.forward(&self.post_attention_layernorm.forward(hidden_states)?)?;
            accum(out.data_mut(), mlp_out.data());
        } else {
            // h = x + attn(ln1(x)); h + mlp(ln2(h))
            let mlp_out = self.mlp.forward(&self.post_attention_layernorm.forward(&out)?)?;
            accum(out.data_mut(), mlp_out.data());
        }
        Ok((out, attn.present))
    }
}

impl Module for NeoXLayer {
    fn name(&self) -> &'static str {
        "GPTNeoXLayer"
    }

    fn children_mut(&mut self) -> Vec<&mut dyn Module> {
        vec![
            &mut self.input_layernorm as &mut dyn Module,
            &mut self.post_attention_layernorm as &mut dyn Module,
            &mut self.attention as &mut dyn Module,
            &mut self.mlp as &mut dyn Module,
        ]
    }
}

/// Output of a full model call.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `[batch, seq, hidden]` after the final LayerNorm
    pub last_hidden_state: Tensor,
    /// One cache per layer, when `use_cache` was set
    pub presents: Option<Vec<LayerPast>>,
}

/// Decoder stack without embeddings, aligned with GPTNeoXModel.
#[derive(Debug, Clone)]
pub struct NeoXModel {
    config: NeoXConfig,
    layers: Vec<NeoXLayer>,
    final_layer_norm: LayerNorm,
}

impl NeoXModel {
    /// Build the stack with every attention layer using `strategy`.
    pub fn new(
        config: NeoXConfig,
        weights: NeoXWeights,
        strategy: AttentionStrategy,
    ) -> Result<Self> {
        config.validate()?;
        if weights.layers.len() != config.num_hidden_layers as usize {
            return Err(StreamError::shape(
                "layer weights",
                config.num_hidden_layers,
                weights.layers.len(),
            ));
        }
        let layers = weights
            .layers
            .into_iter()
            .map(|w| NeoXLayer::new(&config, w, strategy))
            .collect::<Result<Vec<_>>>()?;
        let final_layer_norm = LayerNorm::new(
            weights.final_layer_norm_weight,
            weights.final_layer_norm_bias,
            config.layer_norm_eps,
        )?;
        tracing::debug!(layers = layers.len(), ?strategy, "built model");
        Ok(NeoXModel {
            config,
            layers,
            final_layer_norm,
        })
    }

    pub fn config(&self) -> &NeoXConfig {
        &self.config
    }

    pub fn layers(&self) -> &[NeoXLayer] {
        &self.layers
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        position_ids: &PositionIds,
        attention_mask: Option<&Tensor>,
        past: Option<&[LayerPast]>,
        use_cache: bool,
    ) -> Result<ModelOutput> {
        if let Some(past) = past {
            if past.len() != self.layers.len() {
                return Err(StreamError::shape("past_key_values", self.layers.len(), past.len()));
            }
        }

        let mut hidden = hidden_states.clone();
        let mut presents = Vec::with_capacity(if use_cache { self.layers.len() } else { 0 });
        for (l, layer) in self.layers.iter().enumerate() {
            let layer_past = past.map(|p| &p[l]);
            let (out, present) =
                layer.forward(&hidden, position_ids, attention_mask, layer_past, use_cache)?;
            hidden = out;
            presents.extend(present);
        }

        Ok(ModelOutput {
            last_hidden_state: self.final_layer_norm.forward(&hidden)?,
            presents: use_cache.then_some(presents),
        })
    }
}

impl Module for NeoXModel {
    fn name(&self) -> &'static str {
        "GPTNeoXModel"
    }

    fn children_mut(&mut self) -> Vec<&mut dyn Module> {
        let mut children: Vec<&mut dyn Module> = self
            .layers
            .iter_mut()
            .map(|l| l as &mut dyn Module)
            .collect();
        children.push(&mut self.final_layer_norm);
        children
    }
}
