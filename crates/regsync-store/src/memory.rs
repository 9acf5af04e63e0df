//! In-memory backends
//!
//! Fast, isolated implementations for tests and single-process runs. The
//! aggregate store counts record writes so callers can assert idempotence.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use regsync_core::{AggregateRecord, PartitionId, SourceRow};
use tokio::sync::RwLock;

use crate::source::time_location;
use crate::{AggregateStore, MirroredRecord, RecentMirror, Result, SourceReader};

/// Aggregate store held in a sorted map.
#[derive(Default)]
pub struct InMemoryAggregateStore {
    records: RwLock<BTreeMap<String, AggregateRecord>>,
    writes: AtomicU64,
}

impl InMemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records written since creation (a batch of n counts n).
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<AggregateRecord> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl AggregateStore for InMemoryAggregateStore {
    async fn upsert(&self, record: &AggregateRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.key.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn batch_upsert(&self, records: &[AggregateRecord]) -> Result<()> {
        let mut map = self.records.write().await;
        for record in records {
            map.insert(record.key.clone(), record.clone());
        }
        self.writes.fetch_add(records.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<AggregateRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn query_by_prefix(&self, prefix: &str) -> Result<Vec<AggregateRecord>> {
        let map = self.records.read().await;
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, record)| record.clone())
            .collect())
    }
}

/// Recent mirror keyed by (manifest, record id).
#[derive(Default)]
pub struct InMemoryRecentMirror {
    entries: RwLock<BTreeMap<(String, String), MirroredRecord>>,
}

impl InMemoryRecentMirror {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecentMirror for InMemoryRecentMirror {
    async fn delete_batch(&self, manifest_key: &str, record_ids: &[String]) -> Result<()> {
        let mut entries = self.entries.write().await;
        for id in record_ids {
            entries.remove(&(manifest_key.to_string(), id.clone()));
        }
        Ok(())
    }

    async fn put_batch(&self, records: &[MirroredRecord]) -> Result<()> {
        let mut entries = self.entries.write().await;
        for record in records {
            entries.insert(
                (record.manifest_key.clone(), record.row.record_id.clone()),
                record.clone(),
            );
        }
        Ok(())
    }

    async fn list(&self, manifest_key: &str) -> Result<Vec<MirroredRecord>> {
        let entries = self.entries.read().await;
        let mut out: Vec<MirroredRecord> = entries
            .iter()
            .filter(|((key, _), _)| key == manifest_key)
            .map(|(_, record)| record.clone())
            .collect();
        out.sort_by_key(|r| r.rank);
        Ok(out)
    }
}

/// Source rows held in memory, located by their event time.
#[derive(Default)]
pub struct InMemorySource {
    rows: RwLock<Vec<SourceRow>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<SourceRow>) -> Self {
        Self {
            rows: RwLock::new(rows),
        }
    }

    pub async fn insert(&self, rows: impl IntoIterator<Item = SourceRow>) {
        self.rows.write().await.extend(rows);
    }
}

#[async_trait]
impl SourceReader for InMemorySource {
    async fn scan_partition(&self, partition: &PartitionId) -> Result<Vec<SourceRow>> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|row| PartitionId::new(&row.state) == *partition)
            .cloned()
            .collect())
    }

    async fn fetch_record(
        &self,
        partition: &PartitionId,
        location: &str,
        record_id: &str,
    ) -> Result<Option<SourceRow>> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .find(|row| {
                row.record_id == record_id
                    && PartitionId::new(&row.state) == *partition
                    && time_location(row.occurred_at).starts_with(location)
            })
            .cloned())
    }
}
