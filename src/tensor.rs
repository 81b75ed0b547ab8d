//! Dense row-major f32 tensors and position id grids.

use crate::error::{Result, StreamError};

/// Dense row-major tensor with an explicit shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Wrap `data` as a tensor of the given shape.
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(StreamError::shape("Tensor::new", numel, data.len()));
        }
        Ok(Tensor {
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Tensor {
            shape: shape.to_vec(),
            data: vec![0.0; shape.iter().product()],
        }
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Size of the last axis (1 for a scalar).
    #[inline]
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    pub fn dims3(&self) -> Result<(usize, usize, usize)> {
        match self.shape[..] {
            [a, b, c] => Ok((a, b, c)),
            _ => Err(StreamError::shape("dims3", "rank 3", &self.shape)),
        }
    }

    pub fn dims4(&self) -> Result<(usize, usize, usize, usize)> {
        match self.shape[..] {
            [a, b, c, d] => Ok((a, b, c, d)),
            _ => Err(StreamError::shape("dims4", "rank 4", &self.shape)),
        }
    }

    /// Reinterpret the same data under a new shape.
    pub fn reshape(self, shape: &[usize]) -> Result<Self> {
        Tensor::new(self.data, shape)
    }

    /// Split the shape around `axis` into (outer, axis, inner) element counts.
    fn split_at_axis(&self, axis: usize) -> (usize, usize, usize) {
        let outer = self.shape[..axis].iter().product();
        let inner = self.shape[axis + 1..].iter().product();
        (outer, self.shape[axis], inner)
    }

    /// Take `len` entries starting at `start` along `axis`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Tensor> {
        if axis >= self.rank() {
            return Err(StreamError::shape("narrow axis", self.rank(), axis));
        }
        if start + len > self.shape[axis] {
            return Err(StreamError::shape(
                "narrow range",
                self.shape[axis],
                start..start + len,
            ));
        }
        let (outer, dim, inner) = self.split_at_axis(axis);
        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = o * dim * inner;
            data.extend_from_slice(&self.data[base + start * inner..base + (start + len) * inner]);
        }
        let mut shape = self.shape.clone();
        shape[axis] = len;
        Ok(Tensor { shape, data })
    }

    /// Concatenate tensors along `axis`; all other axes must agree.
    pub fn cat(tensors: &[&Tensor], axis: usize) -> Result<Tensor> {
        let Some(first) = tensors.first() else {
            return Err(StreamError::shape("cat", "at least one tensor", 0));
        };
        if axis >= first.rank() {
            return Err(StreamError::shape("cat axis", first.rank(), axis));
        }
        for t in &tensors[1..] {
            let same_rank = t.rank() == first.rank();
            let compatible = same_rank
                && t.shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !compatible {
                return Err(StreamError::shape("cat", &first.shape, &t.shape));
            }
        }

        let (outer, _, inner) = first.split_at_axis(axis);
        let total: usize = tensors.iter().map(|t| t.shape[axis]).sum();
        let mut data = Vec::with_capacity(outer * total * inner);
        for o in 0..outer {
            for t in tensors {
                let chunk = t.shape[axis] * inner;
                data.extend_from_slice(&t.data[o * chunk..(o + 1) * chunk]);
            }
        }
        let mut shape = first.shape.clone();
        shape[axis] = total;
        Ok(Tensor { shape, data })
    }

    /// Split the last axis at `at`, returning `([..at], [at..])`.
    pub fn split_last(&self, at: usize) -> Result<(Tensor, Tensor)> {
        let axis = self.rank().saturating_sub(1);
        let dim = self.last_dim();
        Ok((self.narrow(axis, 0, at)?, self.narrow(axis, at, dim.saturating_sub(at))?))
    }

    /// Euclidean norm over every element.
    pub fn norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

/// Integer position ids shaped `[batch, seq]`; a batch of 1 broadcasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionIds {
    batch: usize,
    seq: usize,
    ids: Vec<usize>,
}

impl PositionIds {
    pub fn new(ids: Vec<usize>, batch: usize, seq: usize) -> Result<Self> {
        if ids.len() != batch * seq {
            return Err(StreamError::shape("PositionIds::new", batch * seq, ids.len()));
        }
        Ok(PositionIds { batch, seq, ids })
    }

    /// One run `start..start + len` repeated for every batch element.
    pub fn contiguous(batch: usize, start: usize, len: usize) -> Self {
        let ids = (0..batch).flat_map(|_| start..start + len).collect();
        PositionIds {
            batch,
            seq: len,
            ids,
        }
    }

    #[inline]
    pub fn batch(&self) -> usize {
        self.batch
    }

    #[inline]
    pub fn seq(&self) -> usize {
        self.seq
    }

    /// Ids for batch element `b`, honoring batch-1 broadcast.
    #[inline]
    pub fn row(&self, b: usize) -> &[usize] {
        let b = if self.batch == 1 { 0 } else { b };
        &self.ids[b * self.seq..(b + 1) * self.seq]
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.ids
    }
}
