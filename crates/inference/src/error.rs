use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Loading a checkpoint for MP={found} but world size is {world_size}")]
    ShardCountMismatch { found: usize, world_size: usize },

    #[error("Shard file {0} does not embed a rank in its name")]
    ShardMissingRank(PathBuf),

    #[error("Shard file {path} embeds rank {embedded} but sorts at position {position}")]
    ShardRankMismatch {
        path: PathBuf,
        embedded: usize,
        position: usize,
    },

    #[error("Manifest not found: {0}")]
    ManifestNotFound(PathBuf),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Unsupported shard format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Invalid model arguments: {0}")]
    InvalidModelArgs(String),

    #[error("Invalid generation request: {0}")]
    InvalidRequest(String),

    #[error("Context length exceeded: {0} > {1}")]
    ContextLengthExceeded(usize, usize),

    #[error("Tokenization error: {0}")]
    TokenizationError(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Runtime error: {0}")]
    Runtime(#[from] mpllama_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, InferenceError>;
