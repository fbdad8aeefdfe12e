use std::path::PathBuf;

use candle_core::DType;
use clap::Args;
use mpllama_core::AcceleratorEnv;
use mpllama_inference::precision::{parse_precision, select_precision};
use mpllama_inference::{ArchitectureDefaults, GenerationRequest};

pub const DEFAULT_PROMPT: &str = "I believe the meaning of life is";

/// Run options, forwarded unchanged to every worker process.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to tokenizer.json
    #[arg(long)]
    tokenizer_path: PathBuf,

    /// Sampling temperature, 0 for greedy decoding
    #[arg(long, default_value_t = 0.8)]
    temperature: f64,

    /// Nucleus sampling threshold
    #[arg(long, default_value_t = 0.95)]
    top_p: f64,

    #[arg(long, default_value_t = 512)]
    max_seq_len: usize,

    #[arg(long, default_value_t = 32)]
    max_batch_size: usize,

    /// Sharded checkpoint directory; without it the model is built from
    /// --dim/--n-layers/--n-heads with fresh weights
    #[arg(long)]
    ckpt_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 4096)]
    dim: usize,

    #[arg(long, default_value_t = 32)]
    n_layers: usize,

    #[arg(long, default_value_t = 32)]
    n_heads: usize,

    #[arg(long)]
    quant: bool,

    /// Timed generation calls after the warmup
    #[arg(long, default_value_t = 3)]
    n_times: usize,

    /// Spawn one worker process per visible device (requires USE_XLA=1)
    #[arg(long)]
    mp: bool,

    /// Prompt to complete, repeat for a batch
    #[arg(long = "prompt", default_values_t = [DEFAULT_PROMPT.to_string()])]
    prompts: Vec<String>,

    #[arg(long, default_value_t = 256)]
    max_new_tokens: usize,

    /// Construction precision (f32, f16, bf16); defaults to f16 with
    /// USE_CUDA=1 and bf16 otherwise
    #[arg(long, value_parser = precision_arg)]
    precision: Option<DType>,
}

fn precision_arg(s: &str) -> Result<DType, String> {
    parse_precision(s).ok_or_else(|| format!("unknown precision {s:?}, expected f32, f16 or bf16"))
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub tokenizer_path: PathBuf,
    pub temperature: f64,
    pub top_p: f64,
    pub max_seq_len: usize,
    pub max_batch_size: usize,
    pub ckpt_dir: Option<PathBuf>,
    pub architecture: ArchitectureDefaults,
    pub n_times: usize,
    pub use_multiprocess: bool,
    pub prompts: Vec<String>,
    pub max_new_tokens: usize,
    pub precision: Option<DType>,
}

impl From<RunArgs> for RunConfig {
    fn from(args: RunArgs) -> Self {
        Self {
            tokenizer_path: args.tokenizer_path,
            temperature: args.temperature,
            top_p: args.top_p,
            max_seq_len: args.max_seq_len,
            max_batch_size: args.max_batch_size,
            ckpt_dir: args.ckpt_dir,
            architecture: ArchitectureDefaults {
                dim: args.dim,
                n_layers: args.n_layers,
                n_heads: args.n_heads,
                quant: args.quant,
            },
            n_times: args.n_times,
            use_multiprocess: args.mp,
            prompts: args.prompts,
            max_new_tokens: args.max_new_tokens,
            precision: args.precision,
        }
    }
}

impl RunConfig {
    pub fn request(&self) -> GenerationRequest {
        GenerationRequest {
            prompts: self.prompts.clone(),
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }

    /// Explicit `--precision`, else the device-class policy.
    pub fn precision(&self, env: &AcceleratorEnv) -> DType {
        self.precision.unwrap_or_else(|| select_precision(env))
    }

    /// Checkpoint directory as shown in the report, empty when absent.
    pub fn ckpt_dir_display(&self) -> String {
        self.ckpt_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }
}
