use candle_core::{Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use tracing::debug;

use crate::error::{InferenceError, Result};
use crate::model::Transformer;
use crate::tokenizer::TextTokenizer;

/// One batched generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompts: Vec<String>,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
}

impl GenerationRequest {
    pub fn validate(&self) -> Result<()> {
        if self.prompts.is_empty() {
            return Err(InferenceError::InvalidRequest("no prompts".into()));
        }
        if self.max_new_tokens == 0 {
            return Err(InferenceError::InvalidRequest("max_new_tokens must be positive".into()));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(InferenceError::InvalidRequest(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(InferenceError::InvalidRequest(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    /// One decoded text per prompt, in prompt order
    pub texts: Vec<String>,
    /// Newly generated tokens summed over the batch, up to each row's EOS
    pub tokens_generated: usize,
}

/// The generation primitive driven by the orchestrator.
pub trait TextGenerator {
    fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationOutput>;
}

/// Batched autoregressive decoding over a placed [`Transformer`].
///
/// Rows advance together from the shortest prompt; a row still inside its
/// own prompt is fed its prompt token instead of a sample. Decoding stops
/// once every row has produced EOS or `max_new_tokens` tokens.
pub struct LlamaGenerator<T> {
    model: Transformer,
    tokenizer: T,
    device: Device,
    seed: u64,
    calls: u64,
}

impl<T: TextTokenizer> LlamaGenerator<T> {
    pub fn new(model: Transformer, tokenizer: T, device: Device, seed: u64) -> Self {
        Self {
            model,
            tokenizer,
            device,
            seed,
            calls: 0,
        }
    }

    pub fn model(&self) -> &Transformer {
        &self.model
    }

    fn sampler(&mut self, request: &GenerationRequest) -> LogitsProcessor {
        let temperature = (request.temperature > 0.0).then_some(request.temperature);
        let top_p = (request.top_p < 1.0).then_some(request.top_p);
        let seed = self.seed.wrapping_add(self.calls);
        self.calls += 1;
        LogitsProcessor::new(seed, temperature, top_p)
    }
}

impl<T: TextTokenizer> TextGenerator for LlamaGenerator<T> {
    fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationOutput> {
        request.validate()?;
        let max_seq_len = self.model.args().max_seq_len;
        let max_batch_size = self.model.args().max_batch_size;
        let bsz = request.prompts.len();
        if bsz > max_batch_size {
            return Err(InferenceError::InvalidRequest(format!(
                "{bsz} prompts exceed max batch size {max_batch_size}"
            )));
        }

        let prompts = request
            .prompts
            .iter()
            .map(|p| self.tokenizer.encode(p, true))
            .collect::<Result<Vec<_>>>()?;
        let min_prompt = prompts.iter().map(Vec::len).min().unwrap_or(0);
        let max_prompt = prompts.iter().map(Vec::len).max().unwrap_or(0);
        if min_prompt == 0 {
            return Err(InferenceError::InvalidRequest("prompt encodes to no tokens".into()));
        }
        if max_prompt >= max_seq_len {
            return Err(InferenceError::ContextLengthExceeded(max_prompt, max_seq_len));
        }
        let total_len = (max_prompt + request.max_new_tokens).min(max_seq_len);

        let mut sampler = self.sampler(request);
        let eos = self.tokenizer.eos_id();
        let mut rows = prompts.clone();
        let mut finished = vec![false; bsz];
        let mut tokens_generated = 0;
        let mut prev_pos = 0;

        for cur_pos in min_prompt..total_len {
            let input: Vec<u32> = rows
                .iter()
                .flat_map(|row| row[prev_pos..cur_pos].iter().copied())
                .collect();
            let input = Tensor::from_vec(input, (bsz, cur_pos - prev_pos), &self.device)?;
            let logits = self.model.forward(&input, prev_pos)?;

            for (i, row) in rows.iter_mut().enumerate() {
                let next = sampler.sample(&logits.get(i)?)?;
                if cur_pos < prompts[i].len() {
                    continue;
                }
                row.push(next);
                if !finished[i] {
                    tokens_generated += 1;
                    let produced = row.len() - prompts[i].len();
                    finished[i] = Some(next) == eos || produced >= request.max_new_tokens;
                }
            }
            prev_pos = cur_pos;

            if finished.iter().all(|f| *f) {
                debug!("All rows finished at position {}", cur_pos);
                break;
            }
        }

        let texts = rows
            .iter()
            .zip(&prompts)
            .map(|(row, prompt)| {
                let completion = &row[prompt.len()..];
                let completion = &completion[..completion.len().min(request.max_new_tokens)];
                let end = completion
                    .iter()
                    .position(|t| Some(*t) == eos)
                    .unwrap_or(completion.len());
                self.tokenizer.decode(&row[..prompt.len() + end])
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(GenerationOutput {
            texts,
            tokens_generated,
        })
    }
}
