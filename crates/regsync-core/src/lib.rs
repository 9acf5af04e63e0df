//! regsync core types
//!
//! Pure, I/O-free building blocks shared by the store and engine crates:
//!
//! - **record**: source rows, per-scope aggregate records and their keys
//! - **partition**: partition identifiers and the declared rebuild order
//! - **chunk**: serialized-size estimation and ceiling-respecting splitting
//! - **manifest**: recent-N manifests and their ordering rules
//! - **progress**: checkpoint and lock payloads persisted between invocations

pub mod chunk;
pub mod error;
pub mod manifest;
pub mod partition;
pub mod progress;
pub mod record;

pub use chunk::{
    chunk_record, estimate_size, reassemble, split_for_ceiling, ChunkedRecord,
    DEFAULT_RESERVED_METADATA_BYTES,
};
pub use error::{CoreError, Result};
pub use manifest::{manifest_key, select_recent, Manifest, MAX_RECENT};
pub use partition::{next_in_order, PartitionId, DEFAULT_PARTITION_ORDER};
pub use progress::{Checkpoint, JobKind, Lock};
pub use record::{
    chunk_key, entity_key, AggregateRecord, ChunkInfo, Scope, SourceRow, Stats, NATION_ENTITY,
};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
