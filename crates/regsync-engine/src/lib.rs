//! regsync Engine
//!
//! Keeps the pre-aggregated read path consistent with the append-only source
//! lake under three constraints at once: every invocation has a time budget
//! and must suspend and resume across invocations, every destination record
//! has a size ceiling, and delivery is at-least-once so every write must be
//! idempotent.
//!
//! ## Components
//!
//! - [`DeltaSyncEngine`]: routine sync; writes only what changed since the
//!   last fully drained snapshot
//! - [`RebuildEngine`]: full re-derivation of a partition, city by city, with
//!   suspend, revert and chained hand-off
//! - [`ManifestEngine`]: recent-N manifests and their exact-replace mirror
//! - [`RollupEngine`]: national record from all committed states
//! - [`Consumer`] / [`ConsumerPool`] / [`Scheduler`]: queue entrypoints
//!
//! ## Example
//!
//! ```ignore
//! let ctx = EngineContext::new(config, object_store, "regsync", source, aggregates, mirror, queue);
//! Scheduler::new(ctx.clone()).fan_out(ScheduledJob::Sync).await?;
//! ConsumerPool::new(ctx, 2).run_until_idle().await?;
//! ```

pub mod aggregate;
pub mod alias;
pub mod budget;
pub mod config;
pub mod context;
pub mod delta_sync;
pub mod error;
pub mod manifest;
pub mod queue;
pub mod rebuild;
pub mod rollup;
pub mod worker;
pub mod writer;

pub use aggregate::{aggregate_rows, contribute_city, group_by_city, CityContribution, PartitionAggregate};
pub use alias::{normalize_brand, AliasCache, ALIAS_TABLE_KEY};
pub use budget::InvocationBudget;
pub use config::EngineConfig;
pub use context::EngineContext;
pub use delta_sync::{DeltaSyncEngine, SyncReport, SyncStatus};
pub use error::{EngineError, Result};
pub use manifest::{ManifestEngine, ManifestReport, RecordLocator};
pub use queue::{parse_message, InMemoryWorkQueue, WorkMessage, WorkQueue};
pub use rebuild::{Handoff, RebuildEngine, RebuildReport, RebuildStatus};
pub use rollup::{RollupEngine, RollupReport, RollupStatus};
pub use worker::{Consumer, ConsumerPool, DrainSummary, HandlerStatus, ScheduledJob, Scheduler};
