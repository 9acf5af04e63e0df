//! Core error types
//!
//! Errors raised by the pure parts of the engine: size accounting, chunking
//! and reassembly. None of these involve I/O; a `CoreError` always points at
//! a record that cannot be laid out within the configured ceiling or at a
//! chunk family that is incomplete.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Ceiling of {ceiling} bytes leaves no room after {reserved} reserved metadata bytes")]
    CeilingTooSmall { ceiling: usize, reserved: usize },

    #[error("Record {key} is {size} bytes without its split field, budget is {budget}")]
    BaseExceedsCeiling {
        key: String,
        size: usize,
        budget: usize,
    },

    #[error("Entry {entry} of record {key} needs {size} bytes and cannot fit any chunk")]
    EntryTooLarge {
        key: String,
        entry: String,
        size: usize,
    },

    #[error("Chunk {key} is {size} bytes, over the {ceiling} byte ceiling")]
    ChunkOverflow {
        key: String,
        size: usize,
        ceiling: usize,
    },

    #[error("Missing chunk {index} for record {key}")]
    MissingChunk { key: String, index: u32 },

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}
