use thiserror::Error;

/// Errors raised by the pipeline core and its stages
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("Context error: {0}")]
    ContextError(String),

    #[error("Stage execution failed: {0}")]
    StageFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
