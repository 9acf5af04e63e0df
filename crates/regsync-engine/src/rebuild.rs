//! Rebuild Engine
//!
//! Re-derives every aggregate record and manifest of a partition from source
//! rows, one city at a time, without trusting anything previously stored.
//!
//! ## State machine
//!
//! ```text
//! IDLE ──acquire lock──► RUNNING
//! RUNNING ──time budget spent──────────► SUSPENDED_TIME  checkpoint at next city
//! RUNNING ──projected ≥ soft warn──────► SUSPENDED_SIZE  checkpoint at next city
//! RUNNING ──projected ≥ hard ceiling───► REVERTED        undo last city, checkpoint at it
//! RUNNING ──all cities drained─────────► DONE            clear checkpoint
//! RUNNING ──error──────────────────────► FAILED          checkpoint left for the retry
//! ```
//!
//! Every exit releases the lock. A contended lock is a no-op exit.
//!
//! ## Projected size
//!
//! The serialized size of the city records this invocation will commit plus
//! the partition's state record. It starts from zero in every invocation, so
//! a resumed pass always makes progress. A single city that alone crosses the
//! hard ceiling is committed anyway, split by the chunker.
//!
//! ## Resume
//!
//! The checkpoint's cursor is the name of the first city not yet committed.
//! Its state carries the running state and company totals, so a resumed pass
//! continues them instead of reading them back from the store.
//!
//! ## Chaining
//!
//! In chain mode a partition that reaches DONE releases its lock, publishes a
//! rebuild for the next partition in the declared order, then polls the run
//! log (bounded, exponential backoff) for that partition's start. An
//! unverified hand-off raises an operator alert but the finished partition
//! stays finished.

use std::collections::{BTreeMap, BTreeSet};

use regsync_core::{
    estimate_size, next_in_order, now_ms, AggregateRecord, Checkpoint, JobKind, PartitionId, Scope,
};
use regsync_observability::metrics;
use regsync_store::{LockAttempt, RunOutcome};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::aggregate::{contribute_city, group_by_city};
use crate::budget::InvocationBudget;
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::manifest::ManifestEngine;
use crate::queue::WorkMessage;
use crate::writer::{chunk_all, write_all};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildStatus {
    Done,
    SuspendedTime { cursor: String },
    SuspendedSize { cursor: String },
    Reverted { cursor: String },
    Contended { holder: String },
}

impl RebuildStatus {
    pub fn cursor(&self) -> Option<&str> {
        match self {
            RebuildStatus::SuspendedTime { cursor }
            | RebuildStatus::SuspendedSize { cursor }
            | RebuildStatus::Reverted { cursor } => Some(cursor),
            _ => None,
        }
    }
}

/// Outcome of a chained hand-off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    pub next: PartitionId,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub partition: PartitionId,
    pub status: RebuildStatus,
    /// Cities committed by this invocation
    pub children_processed: usize,
    pub records_written: usize,
    /// `state#<P>` count after this invocation's commit
    pub committed_count: u64,
    pub handoff: Option<Handoff>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RebuildCheckpointState {
    state: Option<AggregateRecord>,
    #[serde(default)]
    companies: BTreeMap<String, AggregateRecord>,
}

pub struct RebuildEngine {
    ctx: EngineContext,
    manifests: ManifestEngine,
}

impl RebuildEngine {
    pub fn new(ctx: EngineContext) -> Self {
        let manifests = ManifestEngine::new(ctx.clone());
        Self { ctx, manifests }
    }

    /// Run one rebuild invocation for a partition.
    pub async fn rebuild_partition(&self, partition: &PartitionId, chain: bool) -> Result<RebuildReport> {
        let budget = InvocationBudget::start(self.ctx.config.time_budget());
        let timer = metrics::PASS_DURATION.with_label_values(&["rebuild"]).start_timer();

        let held = match self
            .ctx
            .locks
            .acquire(&format!("rebuild/{}", partition), self.ctx.config.lock_ttl())
            .await?
        {
            LockAttempt::Acquired(held) => held,
            LockAttempt::Contended { holder, expires_at } => {
                info!(partition = %partition, holder = %holder, expires_at, "rebuild already running, skipping");
                metrics::LOCK_CONTENDED_TOTAL.with_label_values(&["rebuild"]).inc();
                self.ctx
                    .log_run(JobKind::Rebuild, partition, RunOutcome::LockContended, holder.clone())
                    .await;
                return Ok(RebuildReport {
                    partition: partition.clone(),
                    status: RebuildStatus::Contended { holder },
                    children_processed: 0,
                    records_written: 0,
                    committed_count: 0,
                    handoff: None,
                });
            }
        };

        info!(partition = %partition, chain, "rebuild started");
        self.ctx
            .log_run(JobKind::Rebuild, partition, RunOutcome::Started, if chain { "chain" } else { "" })
            .await;
        let result = self.run_locked(partition, &budget).await;

        if let Err(e) = self.ctx.locks.release(&held).await {
            warn!(partition = %partition, error = %e, "failed to release rebuild lock");
        }
        timer.observe_duration();

        let mut report = match result {
            Ok(report) => report,
            Err(e) => {
                error!(partition = %partition, error = %e, "rebuild failed, checkpoint kept for retry");
                metrics::PASS_OUTCOMES_TOTAL.with_label_values(&["rebuild", "failed"]).inc();
                self.ctx
                    .log_run(JobKind::Rebuild, partition, RunOutcome::Failed, e.to_string())
                    .await;
                return Err(e);
            }
        };

        let (outcome, label) = match &report.status {
            RebuildStatus::Done => (RunOutcome::Completed, "completed"),
            RebuildStatus::SuspendedTime { .. } | RebuildStatus::SuspendedSize { .. } => {
                (RunOutcome::Suspended, "suspended")
            }
            RebuildStatus::Reverted { .. } => (RunOutcome::Reverted, "reverted"),
            RebuildStatus::Contended { .. } => (RunOutcome::LockContended, "contended"),
        };
        metrics::PASS_OUTCOMES_TOTAL.with_label_values(&["rebuild", label]).inc();
        self.ctx
            .log_run(
                JobKind::Rebuild,
                partition,
                outcome,
                format!(
                    "children={} records={} count={} cursor={}",
                    report.children_processed,
                    report.records_written,
                    report.committed_count,
                    report.status.cursor().unwrap_or("-")
                ),
            )
            .await;

        match &report.status {
            RebuildStatus::Done if chain => {
                report.handoff = self.hand_off(partition).await;
            }
            RebuildStatus::SuspendedTime { .. }
            | RebuildStatus::SuspendedSize { .. }
            | RebuildStatus::Reverted { .. } => {
                self.ctx
                    .queue
                    .publish(&WorkMessage::Rebuild {
                        partition: partition.clone(),
                        chain,
                    })
                    .await?;
            }
            _ => {}
        }
        Ok(report)
    }

    async fn run_locked(&self, partition: &PartitionId, budget: &InvocationBudget) -> Result<RebuildReport> {
        let config = &self.ctx.config;
        let now = now_ms();

        let checkpoint = self.ctx.checkpoints.load(JobKind::Rebuild, partition).await?;
        let (mut state, mut companies, cursor, mut items) = match checkpoint {
            Some(cp) => {
                let saved: RebuildCheckpointState = serde_json::from_value(cp.state).map_err(|e| {
                    EngineError::CorruptCheckpoint {
                        partition: partition.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                info!(partition = %partition, cursor = %cp.cursor, items = cp.items_processed, "resuming rebuild");
                let state = saved.state.unwrap_or_else(|| empty_state(partition, now));
                (state, saved.companies, Some(cp.cursor), cp.items_processed)
            }
            None => (empty_state(partition, now), BTreeMap::new(), None, 0),
        };

        let rows = self.ctx.source.scan_partition(partition).await?;
        let cities = group_by_city(&rows);
        let remaining: Vec<(&String, &Vec<_>)> = cities
            .iter()
            .filter(|(name, _)| cursor.as_deref().map_or(true, |c| name.as_str() >= c))
            .collect();

        let mut pending: Vec<AggregateRecord> = Vec::new();
        let mut pending_bytes = 0usize;
        let mut touched: BTreeSet<String> = BTreeSet::new();
        let mut stop: Option<RebuildStatus> = None;

        for (i, (city, city_rows)) in remaining.iter().enumerate() {
            let contribution = contribute_city(partition, city, city_rows, &self.ctx.aliases, now).await?;
            state.merge(&contribution.state);
            for (brand, share) in &contribution.companies {
                companies
                    .entry(brand.clone())
                    .or_insert_with(|| AggregateRecord::new(Scope::Company, partition.clone(), brand.clone(), now))
                    .merge(share);
            }

            let city_bytes = estimate_size(&contribution.city)?;
            let projected = pending_bytes + city_bytes + estimate_size(&state)?;

            if projected >= config.rebuild_hard_ceiling_bytes {
                if !pending.is_empty() {
                    state.unmerge(&contribution.state);
                    for (brand, share) in &contribution.companies {
                        if let Some(company) = companies.get_mut(brand) {
                            company.unmerge(share);
                            if company.count == 0 {
                                companies.remove(brand);
                            }
                        }
                    }
                    warn!(
                        partition = %partition,
                        city = %city,
                        projected,
                        hard_ceiling = config.rebuild_hard_ceiling_bytes,
                        "projected size over hard ceiling, reverting last city"
                    );
                    stop = Some(RebuildStatus::Reverted {
                        cursor: (*city).clone(),
                    });
                    break;
                }
                warn!(
                    partition = %partition,
                    city = %city,
                    projected,
                    hard_ceiling = config.rebuild_hard_ceiling_bytes,
                    "single city over hard ceiling, committing through chunker"
                );
            }

            pending_bytes += city_bytes;
            pending.push(contribution.city);
            touched.extend(contribution.companies.into_keys());
            items += 1;

            let Some((next, _)) = remaining.get(i + 1) else {
                break;
            };
            if projected >= config.rebuild_soft_warn_bytes {
                info!(partition = %partition, projected, next = %next, "projected size over soft threshold, suspending");
                stop = Some(RebuildStatus::SuspendedSize {
                    cursor: (*next).clone(),
                });
                break;
            }
            if budget.exhausted() {
                info!(partition = %partition, elapsed_ms = budget.elapsed_ms(), next = %next, "time budget spent, suspending");
                stop = Some(RebuildStatus::SuspendedTime {
                    cursor: (*next).clone(),
                });
                break;
            }
        }

        let mut records = pending.clone();
        records.push(state.clone());
        records.extend(touched.iter().filter_map(|brand| companies.get(brand)).cloned());
        let laid_out = chunk_all(&records, config)?;
        let written = write_all(self.ctx.aggregates.as_ref(), &laid_out, config).await?;
        metrics::RECORDS_WRITTEN_TOTAL
            .with_label_values(&["rebuild", partition.as_str()])
            .inc_by(written as u64);

        let status = match stop {
            Some(status) => {
                let saved = RebuildCheckpointState {
                    state: Some(state.clone()),
                    companies,
                };
                self.ctx
                    .checkpoints
                    .save(&Checkpoint {
                        job: JobKind::Rebuild,
                        partition: partition.clone(),
                        cursor: status.cursor().unwrap_or_default().to_string(),
                        items_processed: items,
                        saved_at: now_ms(),
                        state: serde_json::to_value(&saved)?,
                    })
                    .await?;
                status
            }
            None => {
                self.manifests.refresh_recent(partition, &rows).await?;
                self.manifests.update_manifests(partition).await?;
                self.ctx.checkpoints.clear(JobKind::Rebuild, partition).await?;
                RebuildStatus::Done
            }
        };

        info!(
            partition = %partition,
            status = ?status,
            children = pending.len(),
            records = written,
            count = state.count,
            elapsed_ms = budget.elapsed_ms(),
            "rebuild invocation finished"
        );
        Ok(RebuildReport {
            partition: partition.clone(),
            status,
            children_processed: pending.len(),
            records_written: written,
            committed_count: state.count,
            handoff: None,
        })
    }

    /// Publish the next partition's rebuild and wait for evidence it started.
    async fn hand_off(&self, partition: &PartitionId) -> Option<Handoff> {
        let order = self.ctx.config.partitions();
        let Some(next) = next_in_order(&order, partition).cloned() else {
            info!(partition = %partition, "last partition in order, chain complete");
            return None;
        };

        let published_at = now_ms();
        let message = WorkMessage::Rebuild {
            partition: next.clone(),
            chain: true,
        };
        let verified = match self.ctx.queue.publish(&message).await {
            Ok(()) => {
                info!(partition = %partition, next = %next, "published chain hand-off");
                self.verify_started(&next, published_at).await
            }
            Err(e) => {
                error!(partition = %partition, next = %next, error = %e, "failed to publish chain hand-off");
                false
            }
        };

        if !verified {
            error!(
                alert = "chain_handoff_unverified",
                partition = %partition,
                next = %next,
                attempts = self.ctx.config.handoff_verify_attempts,
                "next partition never reported a start, chain may be broken"
            );
            metrics::HANDOFF_UNVERIFIED_TOTAL.inc();
            self.ctx
                .log_run(
                    JobKind::Rebuild,
                    partition,
                    RunOutcome::HandoffUnverified,
                    format!("next={next}"),
                )
                .await;
        }
        Some(Handoff { next, verified })
    }

    async fn verify_started(&self, next: &PartitionId, since: i64) -> bool {
        for attempt in 0..self.ctx.config.handoff_verify_attempts {
            match self.ctx.runlog.started_since(JobKind::Rebuild, next, since).await {
                Ok(true) => {
                    info!(next = %next, attempt = attempt + 1, "chain hand-off verified");
                    return true;
                }
                Ok(false) => {}
                Err(e) => warn!(next = %next, error = %e, "run log lookup failed during hand-off check"),
            }
            tokio::time::sleep(self.ctx.config.handoff_backoff(attempt)).await;
        }
        false
    }
}

fn empty_state(partition: &PartitionId, now: i64) -> AggregateRecord {
    AggregateRecord::new(Scope::State, partition.clone(), partition.as_str(), now)
}
