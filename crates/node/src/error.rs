use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Core(#[from] mpllama_core::CoreError),

    #[error(transparent)]
    Inference(#[from] mpllama_inference::InferenceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker rank {rank} failed")]
    WorkerFailed { rank: usize },

    #[error("Pipeline task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, NodeError>;
