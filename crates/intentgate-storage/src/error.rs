use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the settings store.
///
/// Validation variants mean the value was rejected and nothing was written.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to create data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("exemption duration must be between 1 and {max} ms, got {value}")]
    InvalidDuration { value: i64, max: i64 },

    #[error("challenge sentence must not be empty")]
    EmptySentence,
}

pub type Result<T> = std::result::Result<T, StoreError>;
