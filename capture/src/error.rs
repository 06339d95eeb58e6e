use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("payload is not a valid record: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend failed during {operation}: {reason}")]
    Backend {
        operation: &'static str,
        reason: String,
    },
    #[error("failed to encode record {id}: {source}")]
    Encode { id: String, source: CodecError },
    #[error("malformed entry key {0}")]
    MalformedKey(String),
}

impl StoreError {
    pub fn backend(operation: &'static str, reason: impl ToString) -> Self {
        StoreError::Backend {
            operation,
            reason: reason.to_string(),
        }
    }

    /// Encoding failures will fail again with the exact same batch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::backend("sqlite", err)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline is not running")]
    NotRunning,
    #[error("pipeline is already running")]
    AlreadyRunning,
    #[error("batch of {size} records not committed after {attempts} attempts: {source}")]
    CommitFailed {
        size: usize,
        attempts: u32,
        source: StoreError,
    },
    #[error("commit task exited before acknowledging the batch")]
    CommitterGone,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
