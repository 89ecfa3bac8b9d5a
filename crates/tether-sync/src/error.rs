use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("key-value store error: {0}")]
    Kv(String),
    #[error("encryption error: {0}")]
    Crypto(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("version conflict on {key}")]
    VersionConflict { key: String },
    #[error("retries exhausted after {attempts} attempts for {key}")]
    RetryExhausted { key: String, attempts: u32 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}
