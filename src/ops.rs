//! Core numeric operations for GPT-NeoX inference.

use rayon::prelude::*;

/// Matrix-vector multiplication: xout = x @ w.T (+ bias), w is row-major `[out, in]`.
#[inline]
pub fn matmul(xout: &mut [f32], x: &[f32], w: &[f32], bias: Option<&[f32]>) {
    let in_dim = x.len();
    for (i, out) in xout.iter_mut().enumerate() {
        let row = &w[i * in_dim..(i + 1) * in_dim];
        let mut val = bias.map_or(0.0, |b| b[i]);
        for (wj, xj) in row.iter().zip(x) {
            val += wj * xj;
        }
        *out = val;
    }
}

/// Apply `matmul` to every row of a `[rows, in_dim]` buffer, rows in parallel.
pub fn linear(
    x: &[f32],
    in_dim: usize,
    w: &[f32],
    bias: Option<&[f32]>,
    out_dim: usize,
) -> Vec<f32> {
    let rows = x.len() / in_dim;
    let mut out = vec![0.0f32; rows * out_dim];
    out.par_chunks_mut(out_dim)
        .zip(x.par_chunks(in_dim))
        .for_each(|(dest, src)| matmul(dest, src, w, bias));
    out
}

/// Layer normalization over one row, aligned with nn.LayerNorm.
#[inline]
pub fn layer_norm(dest: &mut [f32], src: &[f32], weight: &[f32], bias: &[f32], eps: f32) {
    let n = src.len() as f32;
    let mean = src.iter().sum::<f32>() / n;
    let var = src.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let inv = 1.0 / (var + eps).sqrt();
    for i in 0..dest.len() {
        dest[i] = (src[i] - mean) * inv * weight[i] + bias[i];
    }
}

/// Element-wise accumulation: a += b.
#[inline]
pub fn accum(a: &mut [f32], b: &[f32]) {
    for (ai, bi) in a.iter_mut().zip(b.iter()) {
        *ai += *bi;
    }
}

/// Softmax in-place. A row that is entirely `-inf` becomes all zeros.
#[inline]
pub fn softmax(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let max_val = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max_val == f32::NEG_INFINITY {
        x.fill(0.0);
        return;
    }
    let mut sum = 0.0f32;
    for xi in x.iter_mut() {
        *xi = (*xi - max_val).exp();
        sum += *xi;
    }
    for xi in x.iter_mut() {
        *xi /= sum;
    }
}

/// GELU activation (tanh approximation) in-place.
#[inline]
pub fn gelu(x: &mut [f32]) {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    for v in x.iter_mut() {
        let u = SQRT_2_OVER_PI * (*v + 0.044715 * *v * *v * *v);
        *v = 0.5 * *v * (1.0 + u.tanh());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_adds_bias() {
        let mut out = [0.0f32; 2];
        matmul(&mut out, &[1.0, 2.0], &[1.0, 0.0, 0.0, 1.0], Some(&[0.5, -0.5]));
        assert_eq!(out, [1.5, 1.5]);
    }

    #[test]
    fn linear_projects_each_row() {
        let w = [1.0, 1.0, 2.0, 0.0, 0.0, 3.0];
        let out = linear(&[1.0, 2.0, 3.0, 4.0], 2, &w, None, 3);
        assert_eq!(out, vec![3.0, 2.0, 6.0, 7.0, 6.0, 12.0]);
    }

    #[test]
    fn softmax_zeroes_masked_entries() {
        let mut x = [0.0, f32::NEG_INFINITY, 0.0];
        softmax(&mut x);
        assert_eq!(x[1], 0.0);
        assert!((x[0] - 0.5).abs() < 1e-6);

        let mut all_masked = [f32::NEG_INFINITY; 3];
        softmax(&mut all_masked);
        assert_eq!(all_masked, [0.0; 3]);
    }

    #[test]
    fn layer_norm_centers_and_scales() {
        let mut out = [0.0f32; 4];
        layer_norm(&mut out, &[1.0, 2.0, 3.0, 4.0], &[1.0; 4], &[0.0; 4], 0.0);
        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        let var: f32 = out.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-5);
    }

    #[test]
    fn gelu_fixes_zero_and_passes_large_values() {
        let mut x = [0.0, 10.0, -10.0];
        gelu(&mut x);
        assert_eq!(x[0], 0.0);
        assert!((x[1] - 10.0).abs() < 1e-4);
        assert!(x[2].abs() < 1e-4);
    }
}
