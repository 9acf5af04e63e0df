//! Shared collaborators for the engines.

use std::sync::Arc;

use object_store::ObjectStore;
use regsync_core::{JobKind, PartitionId};
use regsync_store::{
    AggregateStore, CheckpointStore, JsonStore, LockManager, ObjectJsonStore, RecentMirror, RunLog,
    RunOutcome, SnapshotStore, SourceReader,
};
use tracing::warn;

use crate::alias::AliasCache;
use crate::config::EngineConfig;
use crate::queue::WorkQueue;

/// Everything a pass needs, cheap to clone.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub source: Arc<dyn SourceReader>,
    pub aggregates: Arc<dyn AggregateStore>,
    pub mirror: Arc<dyn RecentMirror>,
    pub json: Arc<dyn JsonStore>,
    pub snapshots: Arc<SnapshotStore>,
    pub checkpoints: Arc<CheckpointStore>,
    pub locks: Arc<LockManager>,
    pub runlog: Arc<RunLog>,
    pub aliases: Arc<AliasCache>,
    pub queue: Arc<dyn WorkQueue>,
}

impl EngineContext {
    /// Wire the object-store backed components under `root`.
    pub fn new(
        config: EngineConfig,
        object_store: Arc<dyn ObjectStore>,
        root: &str,
        source: Arc<dyn SourceReader>,
        aggregates: Arc<dyn AggregateStore>,
        mirror: Arc<dyn RecentMirror>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        let json: Arc<dyn JsonStore> = Arc::new(ObjectJsonStore::new(object_store.clone(), root));
        let aliases = AliasCache::new(
            json.clone(),
            config.alias_cache_capacity,
            config.alias_cache_ttl_ms,
        );
        Self {
            snapshots: Arc::new(SnapshotStore::new(object_store, root)),
            checkpoints: Arc::new(CheckpointStore::new(json.clone())),
            locks: Arc::new(LockManager::new(config.worker_id.clone(), json.clone())),
            runlog: Arc::new(RunLog::new(json.clone())),
            aliases: Arc::new(aliases),
            config: Arc::new(config),
            source,
            aggregates,
            mirror,
            json,
            queue,
        }
    }

    /// Append to the run log. A run-log failure never fails the pass.
    pub async fn log_run(
        &self,
        job: JobKind,
        partition: &PartitionId,
        outcome: RunOutcome,
        detail: impl Into<String>,
    ) {
        if let Err(e) = self.runlog.record(job, partition, outcome, detail).await {
            warn!(job = %job, partition = %partition, outcome = ?outcome, error = %e, "failed to write run log entry");
        }
    }
}
