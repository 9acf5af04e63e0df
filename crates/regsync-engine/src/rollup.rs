//! National rollup
//!
//! Triggered by the sentinel message once partitions are believed complete.
//! Folds every committed `state#<P>` record (with its overflow chunks) into
//! the single `nation#US` record, whose children are the states.
//!
//! Partitions with an outstanding checkpoint are still mid-pass; they are
//! logged and counted but do not block the rollup, which simply reflects
//! whatever has been committed so far.

use regsync_core::{
    now_ms, reassemble, AggregateRecord, JobKind, PartitionId, Scope, NATION_ENTITY,
};
use regsync_observability::metrics;
use regsync_store::{LockAttempt, RunOutcome};
use tracing::{error, info, warn};

use crate::context::EngineContext;
use crate::error::Result;
use crate::writer::{chunk_all, write_all};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollupStatus {
    Completed,
    Contended { holder: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupReport {
    pub status: RollupStatus,
    pub states: usize,
    pub records_written: usize,
    /// Partitions with a suspended sync or rebuild at rollup time
    pub outstanding: Vec<PartitionId>,
}

pub struct RollupEngine {
    ctx: EngineContext,
}

impl RollupEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn rollup(&self) -> Result<RollupReport> {
        let nation = PartitionId::new(NATION_ENTITY);
        let held = match self
            .ctx
            .locks
            .acquire("rollup/nation", self.ctx.config.lock_ttl())
            .await?
        {
            LockAttempt::Acquired(held) => held,
            LockAttempt::Contended { holder, .. } => {
                info!(holder = %holder, "national rollup already running, skipping");
                metrics::LOCK_CONTENDED_TOTAL.with_label_values(&["rollup"]).inc();
                self.ctx
                    .log_run(JobKind::Rollup, &nation, RunOutcome::LockContended, holder.clone())
                    .await;
                return Ok(RollupReport {
                    status: RollupStatus::Contended { holder },
                    states: 0,
                    records_written: 0,
                    outstanding: Vec::new(),
                });
            }
        };

        self.ctx
            .log_run(JobKind::Rollup, &nation, RunOutcome::Started, "")
            .await;
        let result = self.run_locked(&nation).await;
        if let Err(e) = self.ctx.locks.release(&held).await {
            warn!(error = %e, "failed to release rollup lock");
        }

        match result {
            Ok(report) => {
                metrics::PASS_OUTCOMES_TOTAL.with_label_values(&["rollup", "completed"]).inc();
                self.ctx
                    .log_run(
                        JobKind::Rollup,
                        &nation,
                        RunOutcome::Completed,
                        format!("states={} outstanding={}", report.states, report.outstanding.len()),
                    )
                    .await;
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "national rollup failed");
                metrics::PASS_OUTCOMES_TOTAL.with_label_values(&["rollup", "failed"]).inc();
                self.ctx
                    .log_run(JobKind::Rollup, &nation, RunOutcome::Failed, e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    async fn run_locked(&self, nation: &PartitionId) -> Result<RollupReport> {
        let mut outstanding = Vec::new();
        for job in [JobKind::Rebuild, JobKind::Sync] {
            let partitions = self.ctx.checkpoints.outstanding(job).await?;
            metrics::OUTSTANDING_CHECKPOINTS
                .with_label_values(&[job.as_str()])
                .set(partitions.len() as i64);
            if !partitions.is_empty() {
                warn!(job = %job, partitions = ?partitions, "rolling up while partitions are mid-pass");
            }
            outstanding.extend(partitions);
        }
        outstanding.sort();
        outstanding.dedup();

        let stored = self.ctx.aggregates.query_by_prefix("state#").await?;
        let mut record = AggregateRecord::new(Scope::Nation, nation.clone(), NATION_ENTITY, now_ms());
        let mut states = 0;
        for primary in stored.iter().filter(|r| !r.is_overflow_chunk()) {
            let chunk_prefix = format!("{}#chunk", primary.key);
            let chunks: Vec<AggregateRecord> = stored
                .iter()
                .filter(|r| r.key.starts_with(&chunk_prefix))
                .cloned()
                .collect();
            let state = reassemble(primary, &chunks)?;

            record.count += state.count;
            record.sum_cents += state.sum_cents;
            for (category, stats) in &state.breakdown {
                record.breakdown.entry(category.clone()).or_default().add(*stats);
            }
            record
                .children
                .insert(state.partition.to_string(), state.stats());
            states += 1;
        }

        let laid_out = chunk_all(&[record], &self.ctx.config)?;
        let written = write_all(self.ctx.aggregates.as_ref(), &laid_out, &self.ctx.config).await?;
        info!(states, records = written, outstanding = outstanding.len(), "national rollup written");

        Ok(RollupReport {
            status: RollupStatus::Completed,
            states,
            records_written: written,
            outstanding,
        })
    }
}
