//! Queue entrypoints
//!
//! ## Scheduler
//!
//! Fans out one message per partition plus one national-rollup sentinel, or
//! starts a sequential chain at the first partition.
//!
//! ## Consumer
//!
//! Handles exactly one message per call. Every handled outcome, including
//! partial failure, lock contention and unrecoverable payloads, is returned
//! as a [`HandlerStatus`] so the queue does not redeliver it. Only unexpected
//! errors propagate, leaving redelivery to the queue.
//!
//! ## ConsumerPool
//!
//! Drives several consumers over one queue. A chained rebuild publishes the
//! next partition and then waits for it to start, so the next message must be
//! picked up by a different consumer than the one handing off. The pool stops
//! once the queue is empty and no consumer is mid-message.

use std::sync::Arc;
use std::time::{Duration, Instant};

use regsync_core::PartitionId;
use regsync_observability::metrics;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::EngineContext;
use crate::delta_sync::{DeltaSyncEngine, SyncStatus};
use crate::error::{EngineError, Result};
use crate::queue::{parse_message, WorkMessage};
use crate::rebuild::{RebuildEngine, RebuildStatus};
use crate::rollup::{RollupEngine, RollupStatus};

/// Non-retry response for a handled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    Completed,
    /// Finished with failed batches; the next pass picks them up
    Partial,
    /// Suspended or reverted; a continuation message was published
    Continued,
    /// Another pass holds the lock
    Skipped,
    BadMessage,
}

/// Messages handled by a drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub handled: usize,
    pub failed: usize,
}

pub struct Consumer {
    ctx: EngineContext,
    sync: DeltaSyncEngine,
    rebuild: RebuildEngine,
    rollup: RollupEngine,
    known: Vec<PartitionId>,
}

impl Consumer {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            known: ctx.config.partitions(),
            sync: DeltaSyncEngine::new(ctx.clone()),
            rebuild: RebuildEngine::new(ctx.clone()),
            rollup: RollupEngine::new(ctx.clone()),
            ctx,
        }
    }

    /// Handle one payload.
    pub async fn handle(&self, payload: &str) -> Result<HandlerStatus> {
        let message = match parse_message(payload, &self.known) {
            Ok(message) => message,
            Err(EngineError::BadMessage(reason)) => {
                warn!(payload = %payload, reason = %reason, "dropping bad message");
                metrics::BAD_MESSAGES_TOTAL.inc();
                return Ok(HandlerStatus::BadMessage);
            }
            Err(e) => return Err(e),
        };
        metrics::MESSAGES_HANDLED_TOTAL
            .with_label_values(&[message.kind()])
            .inc();

        let status = match &message {
            WorkMessage::Sync { partition } => match self.sync.sync_partition(partition).await?.status {
                SyncStatus::Drained => HandlerStatus::Completed,
                SyncStatus::Partial => HandlerStatus::Partial,
                SyncStatus::Suspended { .. } => HandlerStatus::Continued,
                SyncStatus::Contended { .. } => HandlerStatus::Skipped,
            },
            WorkMessage::Rebuild { partition, chain } => {
                match self.rebuild.rebuild_partition(partition, *chain).await?.status {
                    RebuildStatus::Done => HandlerStatus::Completed,
                    RebuildStatus::SuspendedTime { .. }
                    | RebuildStatus::SuspendedSize { .. }
                    | RebuildStatus::Reverted { .. } => HandlerStatus::Continued,
                    RebuildStatus::Contended { .. } => HandlerStatus::Skipped,
                }
            }
            WorkMessage::NationalRollup => match self.rollup.rollup().await?.status {
                RollupStatus::Completed => HandlerStatus::Completed,
                RollupStatus::Contended { .. } => HandlerStatus::Skipped,
            },
        };
        info!(kind = message.kind(), status = ?status, "message handled");
        Ok(status)
    }

    /// Consume until the queue has stayed empty for `idle`.
    ///
    /// Errors are logged and counted; on a real queue the message would be
    /// redelivered.
    pub async fn run(&self, idle: Duration) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        let mut last_message = Instant::now();
        loop {
            match self.ctx.queue.receive().await? {
                Some(payload) => {
                    match self.handle(&payload).await {
                        Ok(_) => summary.handled += 1,
                        Err(e) => {
                            error!(payload = %payload, error = %e, "message failed");
                            summary.failed += 1;
                        }
                    }
                    last_message = Instant::now();
                }
                None if last_message.elapsed() >= idle => return Ok(summary),
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    }

    /// Consume until the queue is empty.
    pub async fn run_until_idle(&self) -> Result<DrainSummary> {
        self.run(Duration::ZERO).await
    }

    /// Pool member loop. Receiving and the emptiness check happen under the
    /// pool lock, and a message counts as busy until its handler returns, so
    /// a continuation published mid-handler is never stranded.
    async fn run_pooled(&self, index: usize, pool: Arc<Mutex<PoolState>>, idle: Duration) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        loop {
            let payload = {
                let mut state = pool.lock().await;
                match self.ctx.queue.receive().await? {
                    Some(payload) => {
                        state.busy += 1;
                        Some(payload)
                    }
                    None if state.busy == 0 && state.last_activity.elapsed() >= idle => {
                        debug!(consumer = index, handled = summary.handled, "pool consumer idle, stopping");
                        return Ok(summary);
                    }
                    None => None,
                }
            };

            let Some(payload) = payload else {
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            };
            match self.handle(&payload).await {
                Ok(_) => summary.handled += 1,
                Err(e) => {
                    error!(consumer = index, payload = %payload, error = %e, "message failed");
                    summary.failed += 1;
                }
            }
            let mut state = pool.lock().await;
            state.busy -= 1;
            state.last_activity = Instant::now();
        }
    }
}

struct PoolState {
    busy: usize,
    last_activity: Instant,
}

/// Concurrent consumers sharing the context's queue.
pub struct ConsumerPool {
    ctx: EngineContext,
    size: usize,
}

impl ConsumerPool {
    /// At least two consumers, so a chain hand-off can be verified.
    pub fn new(ctx: EngineContext, size: usize) -> Self {
        Self { ctx, size: size.max(2) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Consume until the queue has been empty, with every consumer free, for
    /// `idle`.
    pub async fn run(&self, idle: Duration) -> Result<DrainSummary> {
        let pool = Arc::new(Mutex::new(PoolState {
            busy: 0,
            last_activity: Instant::now(),
        }));
        let mut tasks = JoinSet::new();
        for index in 0..self.size {
            let consumer = Consumer::new(self.ctx.clone());
            let pool = pool.clone();
            tasks.spawn(async move { consumer.run_pooled(index, pool, idle).await });
        }

        let mut summary = DrainSummary::default();
        while let Some(joined) = tasks.join_next().await {
            let part = joined.map_err(|e| EngineError::Worker(e.to_string()))??;
            summary.handled += part.handled;
            summary.failed += part.failed;
        }
        info!(
            consumers = self.size,
            handled = summary.handled,
            failed = summary.failed,
            "consumer pool drained"
        );
        Ok(summary)
    }

    pub async fn run_until_idle(&self) -> Result<DrainSummary> {
        self.run(Duration::ZERO).await
    }
}

/// Which pass a fan-out schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledJob {
    Sync,
    Rebuild,
}

pub struct Scheduler {
    ctx: EngineContext,
}

impl Scheduler {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// One message per partition, then the rollup sentinel. Returns the
    /// number of messages published.
    pub async fn fan_out(&self, job: ScheduledJob) -> Result<usize> {
        let partitions = self.ctx.config.partitions();
        for partition in &partitions {
            let message = match job {
                ScheduledJob::Sync => WorkMessage::Sync {
                    partition: partition.clone(),
                },
                ScheduledJob::Rebuild => WorkMessage::Rebuild {
                    partition: partition.clone(),
                    chain: false,
                },
            };
            self.ctx.queue.publish(&message).await?;
        }
        self.ctx.queue.publish(&WorkMessage::NationalRollup).await?;
        info!(job = ?job, partitions = partitions.len(), "fanned out partition messages");
        Ok(partitions.len() + 1)
    }

    /// Start a sequential rebuild at the first partition of the declared
    /// order; each partition hands off to the next.
    pub async fn start_chain(&self) -> Result<Option<PartitionId>> {
        let Some(first) = self.ctx.config.partitions().into_iter().next() else {
            warn!("empty partition order, nothing to chain");
            return Ok(None);
        };
        self.ctx
            .queue
            .publish(&WorkMessage::Rebuild {
                partition: first.clone(),
                chain: true,
            })
            .await?;
        info!(first = %first, "started sequential rebuild chain");
        Ok(Some(first))
    }
}
