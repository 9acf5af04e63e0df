#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use object_store::memory::InMemory;
use regsync_core::{AggregateRecord, PartitionId, SourceRow};
use regsync_engine::writer::chunk_all;
use regsync_engine::{aggregate_rows, EngineConfig, EngineContext, InMemoryWorkQueue};
use regsync_store::{
    AggregateStore, InMemoryAggregateStore, InMemoryRecentMirror, InMemorySource, SourceReader,
    StoreError,
};

pub struct Harness {
    pub ctx: EngineContext,
    pub source: Arc<InMemorySource>,
    pub aggregates: Arc<InMemoryAggregateStore>,
    pub mirror: Arc<InMemoryRecentMirror>,
    pub queue: Arc<InMemoryWorkQueue>,
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        worker_id: "test-worker".to_string(),
        retry_base_ms: 1,
        handoff_verify_attempts: 3,
        handoff_verify_base_ms: 5,
        partition_order: vec!["TX".to_string()],
        ..Default::default()
    }
}

pub fn harness(config: EngineConfig, rows: Vec<SourceRow>) -> Harness {
    let source = Arc::new(InMemorySource::with_rows(rows));
    let aggregates = Arc::new(InMemoryAggregateStore::new());
    let mirror = Arc::new(InMemoryRecentMirror::new());
    let queue = Arc::new(InMemoryWorkQueue::new());
    let ctx = EngineContext::new(
        config,
        Arc::new(InMemory::new()),
        "regsync",
        source.clone(),
        aggregates.clone(),
        mirror.clone(),
        queue.clone(),
    );
    Harness {
        ctx,
        source,
        aggregates,
        mirror,
        queue,
    }
}

/// Context over caller-supplied source and aggregate store.
pub fn context_with(
    config: EngineConfig,
    source: Arc<dyn SourceReader>,
    aggregates: Arc<dyn AggregateStore>,
) -> (EngineContext, Arc<InMemoryWorkQueue>) {
    let queue = Arc::new(InMemoryWorkQueue::new());
    let ctx = EngineContext::new(
        config,
        Arc::new(InMemory::new()),
        "regsync",
        source,
        aggregates,
        Arc::new(InMemoryRecentMirror::new()),
        queue.clone(),
    );
    (ctx, queue)
}

pub fn row(id: &str, company: &str, city: &str, cents: i64, occurred_at: i64) -> SourceRow {
    SourceRow {
        record_id: id.to_string(),
        company: company.to_string(),
        city: city.to_string(),
        state: "TX".to_string(),
        category: "osha".to_string(),
        penalty_cents: cents,
        occurred_at,
    }
}

/// `n` rows spread over a handful of cities and companies.
pub fn spread_rows(n: usize) -> Vec<SourceRow> {
    (0..n)
        .map(|i| {
            row(
                &format!("OSHA-20240315-{i:04}"),
                &format!("Company {}", i % 4),
                &format!("City {}", i % 6),
                (i as i64 + 1) * 100,
                1_710_460_800_000 + i as i64,
            )
        })
        .collect()
}

/// What the store should hold for `rows` after a fully drained pass.
pub async fn expected_records(ctx: &EngineContext, partition: &PartitionId, rows: &[SourceRow]) -> Vec<AggregateRecord> {
    let aggregate = aggregate_rows(partition, rows, &ctx.aliases, 0).await.unwrap();
    chunk_all(&aggregate.records(), &ctx.config).unwrap()
}

pub fn assert_same_records(actual: &[AggregateRecord], expected: &[AggregateRecord]) {
    let mut actual: Vec<&AggregateRecord> = actual.iter().collect();
    actual.sort_by(|a, b| a.key.cmp(&b.key));
    let actual_keys: Vec<&str> = actual.iter().map(|r| r.key.as_str()).collect();
    let expected_keys: Vec<&str> = expected.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(actual_keys, expected_keys);
    for (a, e) in actual.iter().zip(expected) {
        assert!(a.same_content(e), "record {} differs: {:?} vs {:?}", a.key, a, e);
    }
}

/// Aggregate store whose batch writes always fail.
#[derive(Default)]
pub struct FailingStore {
    inner: InMemoryAggregateStore,
}

#[async_trait]
impl AggregateStore for FailingStore {
    async fn upsert(&self, _record: &AggregateRecord) -> regsync_store::Result<()> {
        Err(StoreError::Unavailable("write capacity exceeded".to_string()))
    }

    async fn batch_upsert(&self, _records: &[AggregateRecord]) -> regsync_store::Result<()> {
        Err(StoreError::Unavailable("write capacity exceeded".to_string()))
    }

    async fn get(&self, key: &str) -> regsync_store::Result<Option<AggregateRecord>> {
        self.inner.get(key).await
    }

    async fn query_by_prefix(&self, prefix: &str) -> regsync_store::Result<Vec<AggregateRecord>> {
        self.inner.query_by_prefix(prefix).await
    }
}

/// Source that stalls on every scan.
pub struct SlowSource {
    pub inner: InMemorySource,
    pub delay: Duration,
}

#[async_trait]
impl SourceReader for SlowSource {
    async fn scan_partition(&self, partition: &PartitionId) -> regsync_store::Result<Vec<SourceRow>> {
        tokio::time::sleep(self.delay).await;
        self.inner.scan_partition(partition).await
    }

    async fn fetch_record(
        &self,
        partition: &PartitionId,
        location: &str,
        record_id: &str,
    ) -> regsync_store::Result<Option<SourceRow>> {
        self.inner.fetch_record(partition, location, record_id).await
    }
}
