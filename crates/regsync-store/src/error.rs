//! Store Error Types
//!
//! ## Error Categories
//!
//! ### Backend Errors
//! - `ObjectStore`: object store read/write/list failed
//! - `Database`: SQLite operation failed
//! - `Migration`: schema migration failed on open
//!
//! ### Data Errors
//! - `Serialization`: JSON payload could not be encoded or decoded
//! - `Arrow` / `Parquet`: columnar encode/decode failed
//! - `Corrupt`: a stored object decoded but violates its own schema
//!
//! Lock contention is deliberately absent: losing a lock race is reported
//! through [`crate::LockAttempt`], not as an error.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Core error: {0}")]
    Core(#[from] regsync_core::CoreError),

    #[error("Corrupt object {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StoreError::Migration(e.to_string())
    }
}
