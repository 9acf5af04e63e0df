//! Delta-Sync Engine
//!
//! Keeps the aggregate store in step with the source by writing only what
//! changed since the last fully drained pass.
//!
//! ## Pass
//!
//! 1. Aggregate every source row of the partition and lay the records out
//!    for the destination (`current`)
//! 2. Load the snapshot of the last fully drained pass (`previous`)
//! 3. `delta` = records of `current` that are new or whose content differs
//!    from `previous`, ordered by key. Entities missing from `current` are
//!    left alone (history is additive-only)
//! 4. Write `delta` in batches, each retried with backoff. A batch that still
//!    fails is counted and the pass carries on
//! 5. After each batch, check the time budget. When it is spent, checkpoint
//!    the offset and exit; the next invocation recomputes the same delta and
//!    resumes from the offset
//! 6. Only when every batch landed is `previous` replaced with `current`
//! 7. Once the delta is written (drained or partial), recent manifests are
//!    recomputed from the same rows and their mirrors replaced. A suspended
//!    pass leaves manifests to the invocation that finishes
//!
//! ## Resume safety
//!
//! The checkpoint carries a SHA-256 fingerprint of the delta. If the source
//! changed between invocations the recomputed delta has a different
//! fingerprint and writing restarts at offset 0.

use std::collections::HashMap;

use regsync_core::{now_ms, AggregateRecord, Checkpoint, JobKind, PartitionId};
use regsync_observability::metrics;
use regsync_store::{LockAttempt, RunOutcome};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::aggregate::aggregate_rows;
use crate::budget::InvocationBudget;
use crate::context::EngineContext;
use crate::error::Result;
use crate::manifest::ManifestEngine;
use crate::queue::WorkMessage;
use crate::writer::{chunk_all, write_batch_with_retry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    /// Every delta record landed and the snapshot was replaced
    Drained,
    /// Some batches failed; the snapshot was kept so the next pass retries them
    Partial,
    /// Time budget spent; resumes at `offset`
    Suspended { offset: usize },
    /// Another pass holds the partition
    Contended { holder: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub partition: PartitionId,
    pub status: SyncStatus,
    /// Records written by this invocation
    pub updated: usize,
    /// Records unchanged since the snapshot
    pub skipped: usize,
    pub failed_batches: usize,
    pub delta_len: usize,
}

impl SyncReport {
    fn contended(partition: &PartitionId, holder: String) -> Self {
        Self {
            partition: partition.clone(),
            status: SyncStatus::Contended { holder },
            updated: 0,
            skipped: 0,
            failed_batches: 0,
            delta_len: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SyncCheckpointState {
    fingerprint: String,
    #[serde(default)]
    failed_batches: usize,
}

pub struct DeltaSyncEngine {
    ctx: EngineContext,
    manifests: ManifestEngine,
}

impl DeltaSyncEngine {
    pub fn new(ctx: EngineContext) -> Self {
        let manifests = ManifestEngine::new(ctx.clone());
        Self { ctx, manifests }
    }

    /// Run one sync invocation for a partition.
    pub async fn sync_partition(&self, partition: &PartitionId) -> Result<SyncReport> {
        let budget = InvocationBudget::start(self.ctx.config.time_budget());
        let timer = metrics::PASS_DURATION.with_label_values(&["sync"]).start_timer();

        let held = match self
            .ctx
            .locks
            .acquire(&format!("sync/{}", partition), self.ctx.config.lock_ttl())
            .await?
        {
            LockAttempt::Acquired(held) => held,
            LockAttempt::Contended { holder, expires_at } => {
                info!(partition = %partition, holder = %holder, expires_at, "sync already running, skipping");
                metrics::LOCK_CONTENDED_TOTAL.with_label_values(&["sync"]).inc();
                self.ctx
                    .log_run(JobKind::Sync, partition, RunOutcome::LockContended, holder.clone())
                    .await;
                return Ok(SyncReport::contended(partition, holder));
            }
        };

        self.ctx
            .log_run(JobKind::Sync, partition, RunOutcome::Started, "")
            .await;
        let result = self.run_locked(partition, &budget).await;

        if let Err(e) = self.ctx.locks.release(&held).await {
            warn!(partition = %partition, error = %e, "failed to release sync lock");
        }
        timer.observe_duration();

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                error!(partition = %partition, error = %e, "sync failed");
                metrics::PASS_OUTCOMES_TOTAL.with_label_values(&["sync", "failed"]).inc();
                self.ctx
                    .log_run(JobKind::Sync, partition, RunOutcome::Failed, e.to_string())
                    .await;
                return Err(e);
            }
        };

        let (outcome, label) = match report.status {
            SyncStatus::Drained => (RunOutcome::Completed, "completed"),
            SyncStatus::Partial => (RunOutcome::Failed, "partial"),
            SyncStatus::Suspended { .. } => (RunOutcome::Suspended, "suspended"),
            SyncStatus::Contended { .. } => (RunOutcome::LockContended, "contended"),
        };
        metrics::PASS_OUTCOMES_TOTAL.with_label_values(&["sync", label]).inc();
        self.ctx
            .log_run(
                JobKind::Sync,
                partition,
                outcome,
                format!(
                    "updated={} skipped={} failed_batches={} delta={}",
                    report.updated, report.skipped, report.failed_batches, report.delta_len
                ),
            )
            .await;

        if let SyncStatus::Suspended { .. } = report.status {
            self.ctx
                .queue
                .publish(&WorkMessage::Sync {
                    partition: partition.clone(),
                })
                .await?;
        }
        Ok(report)
    }

    async fn run_locked(&self, partition: &PartitionId, budget: &InvocationBudget) -> Result<SyncReport> {
        let config = &self.ctx.config;
        let label = partition.as_str();

        let rows = self.ctx.source.scan_partition(partition).await?;
        let aggregate = aggregate_rows(partition, &rows, &self.ctx.aliases, now_ms()).await?;
        let current = chunk_all(&aggregate.records(), config)?;

        let previous: HashMap<String, AggregateRecord> = self
            .ctx
            .snapshots
            .load(partition)
            .await?
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();

        let delta = compute_delta(&current, &previous);
        let skipped = current.len() - delta.len();
        let fingerprint = delta_fingerprint(&delta)?;

        let (mut offset, mut failed_batches) = self.resume_point(partition, &fingerprint, delta.len()).await?;
        let resumed_at = offset;
        let mut updated = 0;

        info!(
            partition = %partition,
            rows = rows.len(),
            records = current.len(),
            delta = delta.len(),
            skipped,
            resume_offset = offset,
            "sync computed delta"
        );

        while offset < delta.len() {
            let end = (offset + config.batch_size).min(delta.len());
            let batch = &delta[offset..end];
            match write_batch_with_retry(self.ctx.aggregates.as_ref(), batch, config).await {
                Ok(()) => {
                    updated += batch.len();
                    metrics::RECORDS_WRITTEN_TOTAL
                        .with_label_values(&["sync", label])
                        .inc_by(batch.len() as u64);
                }
                Err(_) => {
                    failed_batches += 1;
                    metrics::BATCH_FAILURES_TOTAL.with_label_values(&["sync", label]).inc();
                }
            }
            offset = end;

            if offset < delta.len() && budget.exhausted() {
                let state = SyncCheckpointState {
                    fingerprint: fingerprint.clone(),
                    failed_batches,
                };
                self.ctx
                    .checkpoints
                    .save(&Checkpoint {
                        job: JobKind::Sync,
                        partition: partition.clone(),
                        cursor: offset.to_string(),
                        items_processed: offset as u64,
                        saved_at: now_ms(),
                        state: serde_json::to_value(&state)?,
                    })
                    .await?;
                info!(
                    partition = %partition,
                    offset,
                    remaining = delta.len() - offset,
                    elapsed_ms = budget.elapsed_ms(),
                    "sync suspended on time budget"
                );
                return Ok(SyncReport {
                    partition: partition.clone(),
                    status: SyncStatus::Suspended { offset },
                    updated,
                    skipped,
                    failed_batches,
                    delta_len: delta.len(),
                });
            }
        }

        metrics::RECORDS_SKIPPED_TOTAL
            .with_label_values(&["sync", label])
            .inc_by(skipped as u64);

        let status = if failed_batches == 0 {
            self.ctx.snapshots.replace(partition, &current).await?;
            SyncStatus::Drained
        } else {
            warn!(
                partition = %partition,
                failed_batches,
                "sync did not fully drain, keeping previous snapshot"
            );
            SyncStatus::Partial
        };
        self.ctx.checkpoints.clear(JobKind::Sync, partition).await?;

        self.manifests.refresh_recent(partition, &rows).await?;
        let mirrored = self.manifests.update_manifests(partition).await?;

        info!(
            partition = %partition,
            updated,
            manifests_applied = mirrored.applied,
            skipped,
            failed_batches,
            resumed_at,
            elapsed_ms = budget.elapsed_ms(),
            status = ?status,
            "sync finished"
        );
        Ok(SyncReport {
            partition: partition.clone(),
            status,
            updated,
            skipped,
            failed_batches,
            delta_len: delta.len(),
        })
    }

    /// Offset and failure count to resume from, or zero when the checkpoint
    /// belongs to a different delta.
    async fn resume_point(&self, partition: &PartitionId, fingerprint: &str, len: usize) -> Result<(usize, usize)> {
        let Some(checkpoint) = self.ctx.checkpoints.load(JobKind::Sync, partition).await? else {
            return Ok((0, 0));
        };
        let state: SyncCheckpointState = match serde_json::from_value(checkpoint.state.clone()) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    partition = %partition,
                    cursor = %checkpoint.cursor,
                    error = %e,
                    "unreadable sync checkpoint state, restarting delta from the beginning"
                );
                return Ok((0, 0));
            }
        };
        if state.fingerprint != fingerprint {
            warn!(
                partition = %partition,
                cursor = %checkpoint.cursor,
                "source changed since checkpoint, restarting delta from the beginning"
            );
            return Ok((0, 0));
        }
        match checkpoint.cursor.parse::<usize>() {
            Ok(offset) => Ok((offset.min(len), state.failed_batches)),
            Err(_) => {
                warn!(partition = %partition, cursor = %checkpoint.cursor, "unreadable sync cursor, restarting");
                Ok((0, 0))
            }
        }
    }
}

/// Records of `current` that are new or changed relative to `previous`.
pub fn compute_delta(
    current: &[AggregateRecord],
    previous: &HashMap<String, AggregateRecord>,
) -> Vec<AggregateRecord> {
    let mut delta: Vec<AggregateRecord> = current
        .iter()
        .filter(|record| {
            previous
                .get(&record.key)
                .map_or(true, |before| !before.same_content(record))
        })
        .cloned()
        .collect();
    delta.sort_by(|a, b| a.key.cmp(&b.key));
    delta
}

/// Content hash of a delta, independent of write timestamps.
pub fn delta_fingerprint(delta: &[AggregateRecord]) -> Result<String> {
    let mut hasher = Sha256::new();
    for record in delta {
        let mut stable = record.clone();
        stable.updated_at = 0;
        hasher.update(serde_json::to_vec(&stable)?);
        hasher.update(b"\n");
    }
    Ok(format!("{:x}", hasher.finalize()))
}
