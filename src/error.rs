use thiserror::Error;

/// Convenience type alias for Results with RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Main error type for the agent runtime
///
/// Covers the full error taxonomy of the runtime: synchronous submission
/// failures, queue transport failures, and executor failures that are
/// converted to data at the worker boundary.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("task queue saturated")]
    QueueSaturated,

    #[error("queue full: {0}")]
    QueueFull(String),

    #[error("queue closed: {0}")]
    QueueClosed(String),

    #[error("timeout: {message}")]
    Timeout { message: String },

    #[error("executor error: {message}")]
    Executor { message: String },

    #[error("queue backend error: {0}")]
    Queue(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RuntimeError {
    /// True for transport failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::QueueFull(_) | RuntimeError::Queue(_))
    }
}
