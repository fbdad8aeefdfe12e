//! Model-parallel building blocks
//!
//! Each rank holds a slice of every large weight matrix:
//!
//! ```text
//! ColumnParallelLinear   W[out/ws, in]   output stays split, or all-gathered
//! RowParallelLinear      W[out, in/ws]   partial outputs all-reduced
//! ParallelEmbedding      E[vocab, dim/ws] embedding columns all-gathered
//! ```
//!
//! With a world size of 1 every collective is the identity and the layers
//! reduce to their dense counterparts.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, Module};
use mpllama_core::ProcessGroup;

use crate::error::{InferenceError, Result};

/// Explicit allocation context for freshly initialised parameters.
#[derive(Debug, Clone)]
pub struct AllocContext {
    pub dtype: DType,
    pub device: Device,
}

impl AllocContext {
    pub fn new(dtype: DType, device: Device) -> Self {
        Self { dtype, device }
    }

    /// Normal(0, std) initialised tensor.
    pub fn randn(&self, shape: (usize, usize), std: f64) -> Result<Tensor> {
        let t = Tensor::randn(0f32, std as f32, shape, &self.device)?;
        Ok(t.to_dtype(self.dtype)?)
    }

    pub fn ones(&self, size: usize) -> Result<Tensor> {
        Ok(Tensor::ones(size, self.dtype, &self.device)?)
    }

    pub fn zeros(&self, shape: (usize, usize, usize, usize)) -> Result<Tensor> {
        Ok(Tensor::zeros(shape, self.dtype, &self.device)?)
    }
}

/// `dim / world_size`, failing when the split is uneven.
pub fn divide(dim: usize, world_size: usize, what: &str) -> Result<usize> {
    if world_size == 0 || dim % world_size != 0 {
        return Err(InferenceError::InvalidModelArgs(format!(
            "{what} ({dim}) is not divisible by world size {world_size}"
        )));
    }
    Ok(dim / world_size)
}

/// Bias-free projection over a plain weight tensor, which stays reachable
/// for checkpoint loading.
fn project(x: &Tensor, weight: &Tensor) -> Result<Tensor> {
    Ok(Linear::new(weight.clone(), None).forward(x)?)
}

/// Linear layer split along its output features.
#[derive(Debug, Clone)]
pub struct ColumnParallelLinear {
    pub(crate) weight: Tensor,
    gather_output: bool,
}

impl ColumnParallelLinear {
    pub fn new(
        in_features: usize,
        out_features: usize,
        gather_output: bool,
        world_size: usize,
        ctx: &AllocContext,
    ) -> Result<Self> {
        let local_out = divide(out_features, world_size, "output features")?;
        let std = 1.0 / (in_features as f64).sqrt();
        Ok(Self::from_weight(ctx.randn((local_out, in_features), std)?, gather_output))
    }

    pub fn from_weight(weight: Tensor, gather_output: bool) -> Self {
        Self {
            weight,
            gather_output,
        }
    }

    pub fn forward(&self, x: &Tensor, group: &ProcessGroup) -> Result<Tensor> {
        let y = project(x, &self.weight)?;
        if self.gather_output {
            let last = y.rank() - 1;
            Ok(group.all_gather(&y, last)?)
        } else {
            Ok(y)
        }
    }
}

/// Linear layer split along its input features; expects split input.
#[derive(Debug, Clone)]
pub struct RowParallelLinear {
    pub(crate) weight: Tensor,
}

impl RowParallelLinear {
    pub fn new(
        in_features: usize,
        out_features: usize,
        world_size: usize,
        ctx: &AllocContext,
    ) -> Result<Self> {
        let local_in = divide(in_features, world_size, "input features")?;
        let std = 1.0 / (in_features as f64).sqrt();
        Ok(Self::from_weight(ctx.randn((out_features, local_in), std)?))
    }

    pub fn from_weight(weight: Tensor) -> Self {
        Self { weight }
    }

    pub fn forward(&self, x: &Tensor, group: &ProcessGroup) -> Result<Tensor> {
        let partial = project(x, &self.weight)?;
        Ok(group.all_reduce_sum(&partial)?)
    }
}

/// Token embedding split along the embedding dimension.
#[derive(Debug, Clone)]
pub struct ParallelEmbedding {
    pub(crate) weight: Tensor,
}

impl ParallelEmbedding {
    pub fn new(vocab_size: usize, dim: usize, world_size: usize, ctx: &AllocContext) -> Result<Self> {
        let local_dim = divide(dim, world_size, "embedding dim")?;
        Ok(Self {
            weight: ctx.randn((vocab_size, local_dim), 1.0)?,
        })
    }

    /// `ids` is `(batch, seq)` of token ids; returns `(batch, seq, dim)`.
    pub fn forward(&self, ids: &Tensor, group: &ProcessGroup) -> Result<Tensor> {
        let (b, s) = ids.dims2()?;
        let local_dim = self.weight.dim(1)?;
        let rows = self.weight.index_select(&ids.flatten_all()?, 0)?;
        let local = rows.reshape((b, s, local_dim))?;
        Ok(group.all_gather(&local, 2)?)
    }
}

/// Root-mean-square layer norm with a learned scale.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    pub(crate) weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(dim: usize, eps: f64, ctx: &AllocContext) -> Result<Self> {
        Ok(Self {
            weight: ctx.ones(dim)?,
            eps,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?.contiguous()?;
        let alpha = self.weight.to_dtype(DType::F32)?.contiguous()?;
        let normed = candle_nn::ops::rms_norm(&x, &alpha, self.eps as f32)?;
        Ok(normed.to_dtype(dtype)?)
    }
}
