//! Model weights for the GPT-NeoX decoder stack.

use crate::config::NeoXConfig;
use crate::error::{Result, StreamError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::SeedableRng;
use rand::distr::{Distribution, Uniform};
use rand::rngs::StdRng;
use std::io::{Read, Write};

/// Weights for a single decoder layer.
#[derive(Debug, Clone)]
pub struct NeoXLayerWeights {
    /// Attention input LayerNorm (input_layernorm.weight / .bias)
    pub input_layernorm_weight: Vec<f32>,
    pub input_layernorm_bias: Vec<f32>,
    /// MLP input LayerNorm (post_attention_layernorm.weight / .bias)
    pub post_attention_layernorm_weight: Vec<f32>,
    pub post_attention_layernorm_bias: Vec<f32>,
    /// Fused QKV projection `[3 * hidden, hidden]` (attention.query_key_value)
    pub qkv_weight: Vec<f32>,
    pub qkv_bias: Vec<f32>,
    /// Attention output projection `[hidden, hidden]` (attention.dense)
    pub dense_weight: Vec<f32>,
    pub dense_bias: Vec<f32>,
    /// MLP up projection `[intermediate, hidden]` (mlp.dense_h_to_4h)
    pub h_to_4h_weight: Vec<f32>,
    pub h_to_4h_bias: Vec<f32>,
    /// MLP down projection `[hidden, intermediate]` (mlp.dense_4h_to_h)
    pub four_h_to_h_weight: Vec<f32>,
    pub four_h_to_h_bias: Vec<f32>,
}

/// All model parameters, aligned with GPTNeoXModel weights in Transformers
/// (without token embeddings).
#[derive(Debug, Clone)]
pub struct NeoXWeights {
    /// Decoder layers (gpt_neox.layers)
    pub layers: Vec<NeoXLayerWeights>,
    /// Final LayerNorm (gpt_neox.final_layer_norm.weight / .bias)
    pub final_layer_norm_weight: Vec<f32>,
    pub final_layer_norm_bias: Vec<f32>,
}

/// Per-layer tensor sizes in checkpoint order.
fn layer_sizes(config: &NeoXConfig) -> [usize; 12] {
    let h = config.hidden_size as usize;
    let i = config.intermediate_size as usize;
    [h, h, h, h, 3 * h * h, 3 * h, h * h, h, i * h, i, h * i, h]
}

impl NeoXLayerWeights {
    fn from_parts(parts: [Vec<f32>; 12]) -> Self {
        let [
            input_layernorm_weight,
            input_layernorm_bias,
            post_attention_layernorm_weight,
            post_attention_layernorm_bias,
            qkv_weight,
            qkv_bias,
            dense_weight,
            dense_bias,
            h_to_4h_weight,
            h_to_4h_bias,
            four_h_to_h_weight,
            four_h_to_h_bias,
        ] = parts;
        NeoXLayerWeights {
            input_layernorm_weight,
            input_layernorm_bias,
            post_attention_layernorm_weight,
            post_attention_layernorm_bias,
            qkv_weight,
            qkv_bias,
            dense_weight,
            dense_bias,
            h_to_4h_weight,
            h_to_4h_bias,
            four_h_to_h_weight,
            four_h_to_h_bias,
        }
    }

    fn parts(&self) -> [&[f32]; 12] {
        [
            &self.input_layernorm_weight,
            &self.input_layernorm_bias,
            &self.post_attention_layernorm_weight,
            &self.post_attention_layernorm_bias,
            &self.qkv_weight,
            &self.qkv_bias,
            &self.dense_weight,
            &self.dense_bias,
            &self.h_to_4h_weight,
            &self.h_to_4h_bias,
            &self.four_h_to_h_weight,
            &self.four_h_to_h_bias,
        ]
    }
}

impl NeoXWeights {
    /// Load weights from a binary reader.
    ///
    /// Each tensor kind is stored for all layers before the next kind.
    pub fn load<R: Read>(reader: &mut R, config: &NeoXConfig) -> Result<Self> {
        let n_layers = config.num_hidden_layers as usize;
        let hidden = config.hidden_size as usize;

        let mut per_layer: Vec<[Vec<f32>; 12]> =
            (0..n_layers).map(|_| Default::default()).collect();
        for (kind, size) in layer_sizes(config).into_iter().enumerate() {
            for parts in per_layer.iter_mut() {
                parts[kind] = read_f32_vec(reader, size)?;
            }
        }
        let final_layer_norm_weight = read_f32_vec(reader, hidden)?;
        let final_layer_norm_bias = read_f32_vec(reader, hidden)?;

        Ok(NeoXWeights {
            layers: per_layer
                .into_iter()
                .map(NeoXLayerWeights::from_parts)
                .collect(),
            final_layer_norm_weight,
            final_layer_norm_bias,
        })
    }

    /// Write weights in the layout `load` reads.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        for kind in 0..12 {
            for layer in &self.layers {
                write_f32_slice(writer, layer.parts()[kind])?;
            }
        }
        write_f32_slice(writer, &self.final_layer_norm_weight)?;
        write_f32_slice(writer, &self.final_layer_norm_bias)?;
        Ok(())
    }

    /// Seeded random weights: uniform projections scaled by `1/sqrt(fan_in)`,
    /// unit LayerNorm gains, zero biases.
    pub fn random(config: &NeoXConfig, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let h = config.hidden_size as usize;
        let i = config.intermediate_size as usize;
        let hidden_bound = 1.0 / (h as f32).sqrt();
        let inter_bound = 1.0 / (i as f32).sqrt();
        let hidden_dist = Uniform::new_inclusive(-hidden_bound, hidden_bound)
            .map_err(|e| StreamError::InvalidConfig(e.to_string()))?;
        let inter_dist = Uniform::new_inclusive(-inter_bound, inter_bound)
            .map_err(|e| StreamError::InvalidConfig(e.to_string()))?;

        let mut sample = |dist: &Uniform<f32>, n: usize| -> Vec<f32> {
            (0..n).map(|_| dist.sample(&mut rng)).collect()
        };

        let layers = (0..config.num_hidden_layers)
            .map(|_| NeoXLayerWeights {
                input_layernorm_weight: vec![1.0; h],
                input_layernorm_bias: vec![0.0; h],
                post_attention_layernorm_weight: vec![1.0; h],
                post_attention_layernorm_bias: vec![0.0; h],
                qkv_weight: sample(&hidden_dist, 3 * h * h),
                qkv_bias: vec![0.0; 3 * h],
                dense_weight: sample(&hidden_dist, h * h),
                dense_bias: vec![0.0; h],
                h_to_4h_weight: sample(&hidden_dist, i * h),
                h_to_4h_bias: vec![0.0; i],
                four_h_to_h_weight: sample(&inter_dist, h * i),
                four_h_to_h_bias: vec![0.0; h],
            })
            .collect();

        Ok(NeoXWeights {
            layers,
            final_layer_norm_weight: vec![1.0; h],
            final_layer_norm_bias: vec![0.0; h],
        })
    }
}

/// Read a vector of f32 values from the reader.
fn read_f32_vec<R: Read>(reader: &mut R, count: usize) -> Result<Vec<f32>> {
    let mut buf = vec![0f32; count];
    for v in buf.iter_mut() {
        *v = reader.read_f32::<LittleEndian>()?;
    }
    Ok(buf)
}

fn write_f32_slice<W: Write>(writer: &mut W, values: &[f32]) -> Result<()> {
    for &v in values {
        writer.write_f32::<LittleEndian>(v)?;
    }
    Ok(())
}
