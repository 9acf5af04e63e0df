//! regsync Store
//!
//! Interfaces to the collaborators the aggregation engine talks to, and the
//! backends that implement them.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────┐   scan / fetch   ┌─────────────────┐
//!  │ Source lake  │ ───────────────► │                 │
//!  │  (Parquet)   │                  │                 │ upsert ┌──────────────────┐
//!  └──────────────┘                  │  regsync-engine │ ─────► │ Aggregate store  │
//!  ┌──────────────┐  get/put JSON    │                 │        │ (SQLite / memory)│
//!  │ Object store │ ◄──────────────► │                 │ mirror ├──────────────────┤
//!  │ checkpoints, │                  │                 │ ─────► │ Recent mirror    │
//!  │ locks, snap- │                  └─────────────────┘        └──────────────────┘
//!  │ shots, runlog│
//!  └──────────────┘
//! ```
//!
//! ## Traits
//!
//! - [`AggregateStore`]: key-value read path for aggregate records
//! - [`RecentMirror`]: downstream copy of each manifest's recent records
//! - [`JsonStore`]: JSON documents by key with conditional writes, backing
//!   checkpoints, locks, manifests and alias tables
//! - [`SourceReader`]: read-only access to normalized source rows
//!
//! All implementations are `Send + Sync` and meant to be shared as `Arc<dyn _>`.

pub mod checkpoint;
pub mod error;
pub mod lock;
pub mod memory;
pub mod object;
pub mod runlog;
pub mod snapshot;
pub mod source;
pub mod sqlite;

pub use checkpoint::CheckpointStore;
pub use error::{Result, StoreError};
pub use lock::{HeldLock, LockAttempt, LockManager};
pub use memory::{InMemoryAggregateStore, InMemoryRecentMirror, InMemorySource};
pub use object::ObjectJsonStore;
pub use runlog::{RunLog, RunLogEntry, RunOutcome};
pub use snapshot::SnapshotStore;
pub use source::{location_for_month, time_location, ParquetSourceReader};
pub use sqlite::SqliteAggregateStore;

use async_trait::async_trait;
use regsync_core::{reassemble, AggregateRecord, PartitionId, SourceRow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Fast read-path key-value store holding aggregate records.
///
/// Every write is an idempotent upsert: replaying a batch leaves the store
/// exactly as a single application would.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn upsert(&self, record: &AggregateRecord) -> Result<()>;

    /// Upsert a batch. Callers keep batches at or below the destination's
    /// batch-write limit.
    async fn batch_upsert(&self, records: &[AggregateRecord]) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<AggregateRecord>>;

    /// All records whose key starts with `prefix`, ordered by key.
    async fn query_by_prefix(&self, prefix: &str) -> Result<Vec<AggregateRecord>>;

    /// Read a primary record and fold its overflow chunks back in.
    async fn get_assembled(&self, key: &str) -> Result<Option<AggregateRecord>> {
        let Some(primary) = self.get(key).await? else {
            return Ok(None);
        };
        if primary.chunk.map(|c| c.total <= 1).unwrap_or(true) {
            return Ok(Some(reassemble(&primary, &[])?));
        }
        let chunks = self.query_by_prefix(&format!("{}#chunk", key)).await?;
        Ok(Some(reassemble(&primary, &chunks)?))
    }
}

/// A recent source row as held by the downstream mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirroredRecord {
    pub manifest_key: String,
    /// Position in the manifest, 0 = most recent
    pub rank: u32,
    pub row: SourceRow,
}

/// Downstream copy of each manifest's most recent records.
#[async_trait]
pub trait RecentMirror: Send + Sync {
    async fn delete_batch(&self, manifest_key: &str, record_ids: &[String]) -> Result<()>;

    async fn put_batch(&self, records: &[MirroredRecord]) -> Result<()>;

    /// Mirrored records for a manifest, ordered by rank.
    async fn list(&self, manifest_key: &str) -> Result<Vec<MirroredRecord>>;
}

/// A stored value with the backend's version tag, used for compare-and-swap.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Option<String>,
}

/// JSON documents addressed by slash-separated keys.
///
/// Keys must be path-safe (`[A-Za-z0-9._=-]` segments).
#[async_trait]
pub trait JsonStore: Send + Sync {
    async fn get_json(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>>;

    async fn put_json(&self, key: &str, value: &serde_json::Value) -> Result<()>;

    /// Write only if nothing is stored under `key`. Returns `false` if
    /// something already was.
    async fn put_json_if_absent(&self, key: &str, value: &serde_json::Value) -> Result<bool>;

    /// Replace only if the stored version still matches. Returns `false` on
    /// a version mismatch.
    async fn put_json_if_version(
        &self,
        key: &str,
        value: &serde_json::Value,
        version: Option<&str>,
    ) -> Result<bool>;

    /// Delete `key`; deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys under `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Typed read from a [`JsonStore`].
pub async fn get_typed<T: DeserializeOwned>(store: &dyn JsonStore, key: &str) -> Result<Option<T>> {
    match store.get_json(key).await? {
        Some(versioned) => Ok(Some(serde_json::from_value(versioned.value)?)),
        None => Ok(None),
    }
}

/// Typed write to a [`JsonStore`].
pub async fn put_typed<T: Serialize + Sync>(store: &dyn JsonStore, key: &str, value: &T) -> Result<()> {
    let json = serde_json::to_value(value)?;
    store.put_json(key, &json).await
}

/// Read-only access to normalized source rows.
///
/// Rows are laid out by partition and then by time partition
/// (`year=YYYY/month=MM`, see [`time_location`]).
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Every row of a partition.
    async fn scan_partition(&self, partition: &PartitionId) -> Result<Vec<SourceRow>>;

    /// Look a single record up under one location. An empty location means
    /// the whole partition.
    async fn fetch_record(
        &self,
        partition: &PartitionId,
        location: &str,
        record_id: &str,
    ) -> Result<Option<SourceRow>>;
}

/// Replace characters that are not safe in an object key segment.
pub fn path_safe(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '=') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Reversible key segment: `[A-Za-z0-9._-]` pass through, every other byte
/// of the UTF-8 encoding (including `=`) becomes `=XX`. Distinct inputs never
/// share a segment.
pub fn escape_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("={:02X}", byte));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_safe() {
        assert_eq!(path_safe("state#TX"), "state_TX");
        assert_eq!(path_safe("acme-corp"), "acme-corp");
        assert_eq!(path_safe("a b/c"), "a_b_c");
    }

    #[test]
    fn test_escape_segment_keeps_distinct_names_apart() {
        assert_eq!(escape_segment("acme-corp"), "acme-corp");
        assert_eq!(escape_segment("café-x"), "caf=C3=A9-x");
        assert_ne!(escape_segment("café-x"), escape_segment("cafè-x"));
        assert_ne!(escape_segment("a=20"), escape_segment("a "));
        assert_eq!(escape_segment("a b/c"), "a=20b=2Fc");
    }
}
