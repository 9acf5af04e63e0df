//! Checkpoint persistence
//!
//! Provides [`CheckpointStore`], which saves, loads and clears resume cursors
//! for suspended passes. One checkpoint exists per (job, partition) and only
//! while that pass is incomplete:
//!
//! - created or overwritten when a pass voluntarily suspends
//! - deleted when the pass completes cleanly
//! - left intact when a pass fails, so the retry resumes where it stopped

use std::sync::Arc;

use regsync_core::{Checkpoint, JobKind, PartitionId};
use tracing::{debug, info};

use crate::{get_typed, path_safe, put_typed, JsonStore, Result};

pub struct CheckpointStore {
    json: Arc<dyn JsonStore>,
}

impl CheckpointStore {
    pub fn new(json: Arc<dyn JsonStore>) -> Self {
        Self { json }
    }

    fn key(job: JobKind, partition: &PartitionId) -> String {
        format!("checkpoints/{}/{}.json", job, path_safe(partition.as_str()))
    }

    pub async fn load(&self, job: JobKind, partition: &PartitionId) -> Result<Option<Checkpoint>> {
        get_typed(self.json.as_ref(), &Self::key(job, partition)).await
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        put_typed(
            self.json.as_ref(),
            &Self::key(checkpoint.job, &checkpoint.partition),
            checkpoint,
        )
        .await?;
        info!(
            job = %checkpoint.job,
            partition = %checkpoint.partition,
            cursor = %checkpoint.cursor,
            items_processed = checkpoint.items_processed,
            "checkpoint saved"
        );
        Ok(())
    }

    pub async fn clear(&self, job: JobKind, partition: &PartitionId) -> Result<()> {
        self.json.delete(&Self::key(job, partition)).await?;
        debug!(job = %job, partition = %partition, "checkpoint cleared");
        Ok(())
    }

    /// Partitions with an incomplete pass of `job`.
    pub async fn outstanding(&self, job: JobKind) -> Result<Vec<PartitionId>> {
        let keys = self.json.list_keys(&format!("checkpoints/{}/", job)).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.rsplit('/').next())
            .filter_map(|name| name.strip_suffix(".json"))
            .map(PartitionId::new)
            .collect())
    }
}
