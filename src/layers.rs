//! Host-model layers: linear projections, LayerNorm, and the MLP.

use crate::error::{Result, StreamError};
use crate::module::Module;
use crate::ops::{gelu, layer_norm, linear};
use crate::tensor::Tensor;

/// Affine projection over the last axis, aligned with nn.Linear.
#[derive(Debug, Clone)]
pub struct Linear {
    in_features: usize,
    out_features: usize,
    /// Row-major `[out_features, in_features]`
    weight: Vec<f32>,
    bias: Option<Vec<f32>>,
}

impl Linear {
    pub fn new(
        weight: Vec<f32>,
        bias: Option<Vec<f32>>,
        in_features: usize,
        out_features: usize,
    ) -> Result<Self> {
        if weight.len() != in_features * out_features {
            return Err(StreamError::shape(
                "Linear weight",
                [out_features, in_features],
                weight.len(),
            ));
        }
        if let Some(b) = &bias {
            if b.len() != out_features {
                return Err(StreamError::shape("Linear bias", out_features, b.len()));
            }
        }
        Ok(Linear {
            in_features,
            out_features,
            weight,
            bias,
        })
    }

    #[inline]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if x.last_dim() != self.in_features {
            return Err(StreamError::shape("Linear input", self.in_features, x.shape()));
        }
        let out = linear(
            x.data(),
            self.in_features,
            &self.weight,
            self.bias.as_deref(),
            self.out_features,
        );
        let mut shape = x.shape().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = self.out_features;
        }
        Tensor::new(out, &shape)
    }
}

impl Module for Linear {
    fn name(&self) -> &'static str {
        "Linear"
    }
}

#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Vec<f32>,
    bias: Vec<f32>,
    eps: f32,
}

impl LayerNorm {
    pub fn new(weight: Vec<f32>, bias: Vec<f32>, eps: f32) -> Result<Self> {
        if weight.len() != bias.len() {
            return Err(StreamError::shape("LayerNorm bias", weight.len(), bias.len()));
        }
        Ok(LayerNorm { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dim = self.weight.len();
        if x.last_dim() != dim {
            return Err(StreamError::shape("LayerNorm input", dim, x.shape()));
        }
        let mut out = Tensor::zeros(x.shape());
        if dim == 0 {
            return Ok(out);
        }
        for (dst, src) in out.data_mut().chunks_mut(dim).zip(x.data().chunks(dim)) {
            layer_norm(dst, src, &self.weight, &self.bias, self.eps);
        }
        Ok(out)
    }
}

impl Module for LayerNorm {
    fn name(&self) -> &'static str {
        "LayerNorm"
    }
}

/// Feed-forward block, aligned with GPTNeoXMLP.forward.
#[derive(Debug, Clone)]
pub struct Mlp {
    dense_h_to_4h: Linear,
    dense_4h_to_h: Linear,
}

impl Mlp {
    pub fn new(dense_h_to_4h: Linear, dense_4h_to_h: Linear) -> Self {
        Mlp {
            dense_h_to_4h,
            dense_4h_to_h,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = self.dense_h_to_4h.forward(x)?;
        gelu(h.data_mut());
        self.dense_4h_to_h.forward(&h)
    }
}

impl Module for Mlp {
    fn name(&self) -> &'static str {
        "GPTNeoXMLP"
    }

    fn children_mut(&mut self) -> Vec<&mut dyn Module> {
        vec![
            &mut self.dense_h_to_4h as &mut dyn Module,
            &mut self.dense_4h_to_h as &mut dyn Module,
        ]
    }
}
