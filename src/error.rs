//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced by the monitoring/evaluation engine.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("restoration batch overflow: produced more than {limit} readings while restoring a single cluster")]
    RestorationBatchOverflow { limit: usize },

    #[error("unknown aggregation type: {0}")]
    UnknownAggregation(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
