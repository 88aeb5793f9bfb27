use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("place not found: {0}")]
    NotFound(String),

    /// Non-fatal: the candidate was queued and will be retried by `retry_pending`.
    #[error("could not merge {source_key}: {reason}")]
    MergeFailure { source_key: String, reason: String },

    #[error("invalid confidence {0}, expected a value in 0.0..=1.0")]
    InvalidConfidence(f64),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
