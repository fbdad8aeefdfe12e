use thiserror::Error;

/// Errors raised while establishing the process topology and while moving
/// tensors between ranks.
///
/// Every variant is treated as non-transient: callers propagate it and the
/// process exits.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The distributed runtime was queried before it was initialized
    #[error("Distributed runtime not initialized: call DistributedRuntime::init before resolving the topology")]
    RuntimeNotInitialized,

    /// Rank, world size or model-parallel size are inconsistent
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// An environment variable could not be parsed
    #[error("Invalid value for {name}: {value:?}")]
    InvalidEnv { name: String, value: String },

    /// Socket level failure inside the process group
    #[error("Transport error: {0}")]
    Transport(String),

    /// A tensor frame arrived with corrupted payload
    #[error("Tensor checksum mismatch")]
    ChecksumMismatch,

    /// A tensor frame carried a dtype the transport cannot encode
    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    /// A peer answered with a frame that does not fit the running collective
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Failed to serialize or deserialize a frame
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
