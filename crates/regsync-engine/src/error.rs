//! Engine Error Types
//!
//! Only genuine failures are errors. Lock contention, voluntary suspension,
//! size reverts and missing manifest records are reported as pass outcomes.

use regsync_core::CoreError;
use regsync_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Bad message: {0}")]
    BadMessage(String),

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("Corrupt checkpoint for {partition}: {reason}")]
    CorruptCheckpoint { partition: String, reason: String },
}
