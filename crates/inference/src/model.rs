//! Model-parallel LLaMA transformer with a static key/value cache
//!
//! Every rank builds the same layer stack over its own weight slices and
//! runs the same forward pass; the collectives inside the parallel layers
//! keep activations identical across ranks.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use mpllama_core::ProcessGroup;
use tracing::debug;

use crate::checkpoint::CheckpointManifest;
use crate::error::{InferenceError, Result};
use crate::parallel::{
    divide, AllocContext, ColumnParallelLinear, ParallelEmbedding, RmsNorm, RowParallelLinear,
};

const ROPE_THETA: f32 = 10000.0;

/// Fully resolved model hyperparameters for one rank.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArgs {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub vocab_size: usize,
    pub multiple_of: usize,
    pub norm_eps: f64,
    pub quant: bool,
    pub max_seq_len: usize,
    pub max_batch_size: usize,
    /// Model-parallel world size the weights are split over
    pub world_size: usize,
}

impl ModelArgs {
    pub fn from_manifest(
        manifest: &CheckpointManifest,
        max_seq_len: usize,
        max_batch_size: usize,
        world_size: usize,
    ) -> Result<Self> {
        let vocab_size = manifest.vocab_size.ok_or_else(|| {
            InferenceError::InvalidModelArgs("vocab_size was not set from the tokenizer".into())
        })?;
        let args = Self {
            dim: manifest.dim,
            n_layers: manifest.n_layers,
            n_heads: manifest.n_heads,
            vocab_size,
            multiple_of: manifest.multiple_of,
            norm_eps: manifest.norm_eps,
            quant: manifest.quant,
            max_seq_len,
            max_batch_size,
            world_size,
        };
        args.validate()?;
        Ok(args)
    }

    fn validate(&self) -> Result<()> {
        if self.max_seq_len == 0 || self.max_batch_size == 0 {
            return Err(InferenceError::InvalidModelArgs(
                "max_seq_len and max_batch_size must be positive".into(),
            ));
        }
        if self.n_heads == 0 || self.dim % self.n_heads != 0 {
            return Err(InferenceError::InvalidModelArgs(format!(
                "dim {} is not divisible by n_heads {}",
                self.dim, self.n_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(InferenceError::InvalidModelArgs(format!(
                "head dim {} must be even for rotary embeddings",
                self.head_dim()
            )));
        }
        divide(self.n_heads, self.world_size, "n_heads")?;
        divide(self.dim, self.world_size, "dim")?;
        divide(self.vocab_size, self.world_size, "vocab_size")?;
        divide(self.ffn_hidden_dim(), self.world_size, "ffn hidden dim")?;
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Attention heads held by this rank.
    pub fn local_heads(&self) -> usize {
        self.n_heads / self.world_size
    }

    /// `2/3 * 4 * dim` rounded up to a multiple of `multiple_of`.
    pub fn ffn_hidden_dim(&self) -> usize {
        let hidden = 2 * (4 * self.dim) / 3;
        self.multiple_of * hidden.div_ceil(self.multiple_of)
    }
}

/// Precomputed rotary tables of shape `(positions, head_dim / 2)`.
#[derive(Debug, Clone)]
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(head_dim: usize, positions: usize, device: &Device) -> Result<Self> {
        let half = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1.0 / ROPE_THETA.powf((2 * i) as f32 / head_dim as f32))
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let t = Tensor::arange(0u32, positions as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((positions, 1))?;
        let freqs = t.broadcast_mul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    /// Rotate interleaved pairs of `x: (b, s, heads, head_dim)`.
    fn apply(&self, x: &Tensor, start_pos: usize) -> Result<Tensor> {
        let (_b, s, _h, _d) = x.dims4()?;
        let dtype = x.dtype();
        let cos = self.cos.narrow(0, start_pos, s)?.contiguous()?;
        let sin = self.sin.narrow(0, start_pos, s)?.contiguous()?;
        let heads_first = x.to_dtype(DType::F32)?.transpose(1, 2)?.contiguous()?;
        let rotated = candle_nn::rotary_emb::rope_i(&heads_first, &cos, &sin)?;
        Ok(rotated.transpose(1, 2)?.to_dtype(dtype)?.contiguous()?)
    }

    fn to_device(&mut self, device: &Device) -> Result<()> {
        self.cos = self.cos.to_device(device)?;
        self.sin = self.sin.to_device(device)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Attention {
    wq: ColumnParallelLinear,
    wk: ColumnParallelLinear,
    wv: ColumnParallelLinear,
    wo: RowParallelLinear,
    local_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(args: &ModelArgs, ctx: &AllocContext) -> Result<Self> {
        let dim = args.dim;
        let ws = args.world_size;
        Ok(Self {
            wq: ColumnParallelLinear::new(dim, dim, false, ws, ctx)?,
            wk: ColumnParallelLinear::new(dim, dim, false, ws, ctx)?,
            wv: ColumnParallelLinear::new(dim, dim, false, ws, ctx)?,
            wo: RowParallelLinear::new(dim, dim, ws, ctx)?,
            local_heads: args.local_heads(),
            head_dim: args.head_dim(),
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        start_pos: usize,
        cache: &mut (Tensor, Tensor),
        mask: Option<&Tensor>,
        rope: &RotaryEmbedding,
        group: &ProcessGroup,
    ) -> Result<Tensor> {
        let (b, s, _) = x.dims3()?;
        let (h, d) = (self.local_heads, self.head_dim);

        let q = self.wq.forward(x, group)?.reshape((b, s, h, d))?;
        let k = self.wk.forward(x, group)?.reshape((b, s, h, d))?;
        let v = self.wv.forward(x, group)?.reshape((b, s, h, d))?;
        let q = rope.apply(&q, start_pos)?;
        let k = rope.apply(&k, start_pos)?;

        let end = start_pos + s;
        let (k_cache, v_cache) = cache;
        *k_cache = k_cache.slice_assign(&[0..b, start_pos..end, 0..h, 0..d], &k)?;
        *v_cache = v_cache.slice_assign(&[0..b, start_pos..end, 0..h, 0..d], &v)?;
        let keys = k_cache.narrow(0, 0, b)?.narrow(1, 0, end)?;
        let values = v_cache.narrow(0, 0, b)?.narrow(1, 0, end)?;

        // (b, heads, seq, head_dim), attention math in f32
        let q = q.transpose(1, 2)?.to_dtype(DType::F32)?.contiguous()?;
        let keys = keys.transpose(1, 2)?.to_dtype(DType::F32)?.contiguous()?;
        let values = values.transpose(1, 2)?.to_dtype(DType::F32)?.contiguous()?;

        let mut scores = (q.matmul(&keys.t()?)? / (d as f64).sqrt())?;
        if let Some(mask) = mask {
            scores = scores.broadcast_add(mask)?;
        }
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = probs
            .matmul(&values)?
            .transpose(1, 2)?
            .reshape((b, s, h * d))?
            .to_dtype(x.dtype())?;
        self.wo.forward(&out, group)
    }
}

#[derive(Debug, Clone)]
struct FeedForward {
    w1: ColumnParallelLinear,
    w2: RowParallelLinear,
    w3: ColumnParallelLinear,
}

impl FeedForward {
    fn new(args: &ModelArgs, ctx: &AllocContext) -> Result<Self> {
        let hidden = args.ffn_hidden_dim();
        let ws = args.world_size;
        Ok(Self {
            w1: ColumnParallelLinear::new(args.dim, hidden, false, ws, ctx)?,
            w2: RowParallelLinear::new(hidden, args.dim, ws, ctx)?,
            w3: ColumnParallelLinear::new(args.dim, hidden, false, ws, ctx)?,
        })
    }

    fn forward(&self, x: &Tensor, group: &ProcessGroup) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.w1.forward(x, group)?)?;
        let up = self.w3.forward(x, group)?;
        self.w2.forward(&(gate * up)?, group)
    }
}

#[derive(Debug, Clone)]
struct TransformerBlock {
    attention: Attention,
    feed_forward: FeedForward,
    attention_norm: RmsNorm,
    ffn_norm: RmsNorm,
}

impl TransformerBlock {
    fn new(args: &ModelArgs, ctx: &AllocContext) -> Result<Self> {
        Ok(Self {
            attention: Attention::new(args, ctx)?,
            feed_forward: FeedForward::new(args, ctx)?,
            attention_norm: RmsNorm::new(args.dim, args.norm_eps, ctx)?,
            ffn_norm: RmsNorm::new(args.dim, args.norm_eps, ctx)?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        start_pos: usize,
        cache: &mut (Tensor, Tensor),
        mask: Option<&Tensor>,
        rope: &RotaryEmbedding,
        group: &ProcessGroup,
    ) -> Result<Tensor> {
        let attn = self.attention.forward(
            &self.attention_norm.forward(x)?,
            start_pos,
            cache,
            mask,
            rope,
            group,
        )?;
        let h = (x + attn)?;
        let ffn = self.feed_forward.forward(&self.ffn_norm.forward(&h)?, group)?;
        Ok((h + ffn)?)
    }

    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Tensor)>) {
        let a = &self.attention;
        let f = &self.feed_forward;
        out.extend([
            (format!("{prefix}.attention.wq.weight"), &a.wq.weight),
            (format!("{prefix}.attention.wk.weight"), &a.wk.weight),
            (format!("{prefix}.attention.wv.weight"), &a.wv.weight),
            (format!("{prefix}.attention.wo.weight"), &a.wo.weight),
            (format!("{prefix}.feed_forward.w1.weight"), &f.w1.weight),
            (format!("{prefix}.feed_forward.w2.weight"), &f.w2.weight),
            (format!("{prefix}.feed_forward.w3.weight"), &f.w3.weight),
            (format!("{prefix}.attention_norm.weight"), &self.attention_norm.weight),
            (format!("{prefix}.ffn_norm.weight"), &self.ffn_norm.weight),
        ]);
    }

    fn named_parameters_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        let a = &mut self.attention;
        let f = &mut self.feed_forward;
        out.extend([
            (format!("{prefix}.attention.wq.weight"), &mut a.wq.weight),
            (format!("{prefix}.attention.wk.weight"), &mut a.wk.weight),
            (format!("{prefix}.attention.wv.weight"), &mut a.wv.weight),
            (format!("{prefix}.attention.wo.weight"), &mut a.wo.weight),
            (format!("{prefix}.feed_forward.w1.weight"), &mut f.w1.weight),
            (format!("{prefix}.feed_forward.w2.weight"), &mut f.w2.weight),
            (format!("{prefix}.feed_forward.w3.weight"), &mut f.w3.weight),
            (format!("{prefix}.attention_norm.weight"), &mut self.attention_norm.weight),
            (format!("{prefix}.ffn_norm.weight"), &mut self.ffn_norm.weight),
        ]);
    }
}

/// Additive causal mask of shape `(s, start_pos + s)`.
fn causal_mask(s: usize, start_pos: usize, device: &Device) -> Result<Tensor> {
    let total = start_pos + s;
    let mask: Vec<f32> = (0..s)
        .flat_map(|i| {
            (0..total).map(move |j| if j > start_pos + i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (s, total), device)?)
}

pub struct Transformer {
    args: ModelArgs,
    tok_embeddings: ParallelEmbedding,
    layers: Vec<TransformerBlock>,
    norm: RmsNorm,
    output: ColumnParallelLinear,
    rope: RotaryEmbedding,
    group: Arc<ProcessGroup>,
    /// Per-layer `(keys, values)` of shape
    /// `(max_batch_size, max_seq_len, local_heads, head_dim)`. Not a
    /// parameter; [`Transformer::to_device`] leaves it where it is.
    pub cache_kvs: Vec<(Tensor, Tensor)>,
}

impl Transformer {
    pub fn new(args: &ModelArgs, ctx: &AllocContext, group: Arc<ProcessGroup>) -> Result<Self> {
        if group.world_size() != args.world_size {
            return Err(InferenceError::InvalidModelArgs(format!(
                "model split over {} ranks but process group has {}",
                args.world_size,
                group.world_size()
            )));
        }
        if !ctx.dtype.is_float() {
            return Err(InferenceError::InvalidModelArgs(format!(
                "parameters must be floating point, got {:?}",
                ctx.dtype
            )));
        }

        let layers = (0..args.n_layers)
            .map(|_| TransformerBlock::new(args, ctx))
            .collect::<Result<Vec<_>>>()?;
        let cache_shape = (
            args.max_batch_size,
            args.max_seq_len,
            args.local_heads(),
            args.head_dim(),
        );
        let cache_kvs = (0..args.n_layers)
            .map(|_| Ok((ctx.zeros(cache_shape)?, ctx.zeros(cache_shape)?)))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Built {} layers, {} local heads of dim {}, ffn hidden {}",
            args.n_layers,
            args.local_heads(),
            args.head_dim(),
            args.ffn_hidden_dim()
        );

        Ok(Self {
            args: args.clone(),
            tok_embeddings: ParallelEmbedding::new(args.vocab_size, args.dim, args.world_size, ctx)?,
            layers,
            norm: RmsNorm::new(args.dim, args.norm_eps, ctx)?,
            output: ColumnParallelLinear::new(args.dim, args.vocab_size, true, args.world_size, ctx)?,
            rope: RotaryEmbedding::new(args.head_dim(), args.max_seq_len * 2, &ctx.device)?,
            group,
            cache_kvs,
        })
    }

    pub fn args(&self) -> &ModelArgs {
        &self.args
    }

    /// Every learnable tensor with its checkpoint name.
    pub fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = vec![("tok_embeddings.weight".to_string(), &self.tok_embeddings.weight)];
        for (i, layer) in self.layers.iter().enumerate() {
            layer.named_parameters(&format!("layers.{i}"), &mut params);
        }
        params.push(("norm.weight".to_string(), &self.norm.weight));
        params.push(("output.weight".to_string(), &self.output.weight));
        params
    }

    pub fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = vec![(
            "tok_embeddings.weight".to_string(),
            &mut self.tok_embeddings.weight,
        )];
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.named_parameters_mut(&format!("layers.{i}"), &mut params);
        }
        params.push(("norm.weight".to_string(), &mut self.norm.weight));
        params.push(("output.weight".to_string(), &mut self.output.weight));
        params
    }

    pub fn parameters(&self) -> impl Iterator<Item = &Tensor> {
        self.named_parameters().into_iter().map(|(_, t)| t)
    }

    /// Move parameters and buffers. The key/value cache is not moved.
    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        for (_, param) in self.named_parameters_mut() {
            *param = param.to_device(device)?;
        }
        self.rope.to_device(device)
    }

    /// Move every cache tensor, one element at a time.
    pub fn migrate_cache(&mut self, device: &Device) -> Result<()> {
        for (keys, values) in self.cache_kvs.iter_mut() {
            *keys = keys.to_device(device)?;
            *values = values.to_device(device)?;
        }
        Ok(())
    }

    /// Logits for the last position of `tokens: (batch, seq)`, as
    /// `(batch, vocab_size)` f32.
    pub fn forward(&mut self, tokens: &Tensor, start_pos: usize) -> Result<Tensor> {
        let (b, s) = tokens.dims2()?;
        if b == 0 || b > self.args.max_batch_size {
            return Err(InferenceError::InvalidRequest(format!(
                "batch of {b} outside 1..={}",
                self.args.max_batch_size
            )));
        }
        if start_pos + s > self.args.max_seq_len {
            return Err(InferenceError::ContextLengthExceeded(
                start_pos + s,
                self.args.max_seq_len,
            ));
        }

        let mut h = self.tok_embeddings.forward(tokens, &self.group)?;
        let mask = if s > 1 {
            Some(causal_mask(s, start_pos, tokens.device())?)
        } else {
            None
        };
        for (layer, cache) in self.layers.iter().zip(self.cache_kvs.iter_mut()) {
            h = layer.forward(&h, start_pos, cache, mask.as_ref(), &self.rope, &self.group)?;
        }
        let h = self.norm.forward(&h)?;
        let last = h.narrow(1, s - 1, 1)?.squeeze(1)?;
        let logits = self.output.forward(&last, &self.group)?;
        Ok(logits.to_dtype(DType::F32)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::D;

    fn argmax_last(t: &Tensor) -> Vec<u32> {
        t.argmax(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<u32>()
            .unwrap()
    }

    fn tiny_args() -> ModelArgs {
        ModelArgs {
            dim: 32,
            n_layers: 2,
            n_heads: 4,
            vocab_size: 40,
            multiple_of: 16,
            norm_eps: 1e-5,
            quant: false,
            max_seq_len: 16,
            max_batch_size: 2,
            world_size: 1,
        }
    }

    fn tiny_model() -> Transformer {
        let ctx = AllocContext::new(DType::F32, Device::Cpu);
        Transformer::new(&tiny_args(), &ctx, Arc::new(ProcessGroup::single())).unwrap()
    }

    #[test]
    fn test_ffn_hidden_dim() {
        let mut args = tiny_args();
        args.dim = 4096;
        args.multiple_of = 256;
        assert_eq!(args.ffn_hidden_dim(), 11008);
    }

    #[test]
    fn test_from_manifest_requires_vocab() {
        let manifest = CheckpointManifest {
            dim: 32,
            n_layers: 2,
            n_heads: 4,
            quant: false,
            multiple_of: 16,
            norm_eps: 1e-5,
            vocab_size: None,
        };
        assert!(ModelArgs::from_manifest(&manifest, 16, 2, 1).is_err());

        let manifest = CheckpointManifest {
            vocab_size: Some(40),
            ..manifest
        };
        let args = ModelArgs::from_manifest(&manifest, 16, 2, 2).unwrap();
        assert_eq!(args.local_heads(), 2);
        assert_eq!(args.head_dim(), 8);
    }

    #[test]
    fn test_uneven_split_rejected() {
        let mut args = tiny_args();
        args.world_size = 3;
        assert!(matches!(
            args.validate(),
            Err(InferenceError::InvalidModelArgs(_))
        ));
    }

    #[test]
    fn test_rotary_rotates_interleaved_pairs() {
        let rope = RotaryEmbedding::new(4, 8, &Device::Cpu).unwrap();
        // one head, pairs (1, 0) and (0, 1) at positions 0 and 1
        let x = Tensor::new(&[[[[1f32, 0., 0., 1.]], [[1., 0., 0., 1.]]]], &Device::Cpu).unwrap();
        let out = rope.apply(&x, 0).unwrap();
        assert_eq!(out.dims(), &[1, 2, 1, 4]);
        let out = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();

        let expected_pos0 = [1f32, 0., 0., 1.];
        // first pair turns by 1 rad, second by 1/100 rad
        let (c0, s0) = (1f32.cos(), 1f32.sin());
        let (c1, s1) = (0.01f32.cos(), 0.01f32.sin());
        let expected_pos1 = [c0, s0, -s1, c1];
        for (a, b) in out.iter().zip(expected_pos0.iter().chain(&expected_pos1)) {
            assert!((a - b).abs() < 1e-5, "{a} != {b}");
        }
    }

    #[test]
    fn test_parameter_names() {
        let model = tiny_model();
        let names: Vec<String> = model.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names.len(), 2 + 9 * 2 + 1);
        assert_eq!(names[0], "tok_embeddings.weight");
        assert!(names.contains(&"layers.1.feed_forward.w2.weight".to_string()));
        assert_eq!(names.last().unwrap(), "output.weight");
    }

    #[test]
    fn test_cache_shape() {
        let model = tiny_model();
        assert_eq!(model.cache_kvs.len(), 2);
        for (k, v) in &model.cache_kvs {
            assert_eq!(k.dims(), &[2, 16, 4, 8]);
            assert_eq!(v.dims(), &[2, 16, 4, 8]);
        }
    }

    #[test]
    fn test_forward_shape() {
        let mut model = tiny_model();
        let tokens = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &Device::Cpu).unwrap();
        let logits = model.forward(&tokens, 0).unwrap();
        assert_eq!(logits.dims(), &[2, 40]);
        assert_eq!(logits.dtype(), DType::F32);
    }

    #[test]
    fn test_incremental_decode_matches_prefill() {
        let mut model = tiny_model();
        let full = Tensor::new(&[[3u32, 7, 11, 5]], &Device::Cpu).unwrap();
        let prefill = model.forward(&full, 0).unwrap();

        let head = Tensor::new(&[[3u32, 7, 11]], &Device::Cpu).unwrap();
        let tail = Tensor::new(&[[5u32]], &Device::Cpu).unwrap();
        model.forward(&head, 0).unwrap();
        let step = model.forward(&tail, 3).unwrap();

        let a = prefill.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = step.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-4, "{x} != {y}");
        }
        assert_eq!(argmax_last(&prefill), argmax_last(&step));
    }

    #[test]
    fn test_context_overflow() {
        let mut model = tiny_model();
        let tokens = Tensor::new(&[[1u32, 2]], &Device::Cpu).unwrap();
        assert!(matches!(
            model.forward(&tokens, 15),
            Err(InferenceError::ContextLengthExceeded(17, 16))
        ));
    }

    #[test]
    fn test_to_device_leaves_cache() {
        let mut model = tiny_model();
        model.to_device(&Device::Cpu).unwrap();
        model.migrate_cache(&Device::Cpu).unwrap();
        assert!(model.parameters().all(|p| p.device().is_cpu()));
        assert!(model.cache_kvs.iter().all(|(k, v)| k.device().is_cpu() && v.device().is_cpu()));
    }
}
