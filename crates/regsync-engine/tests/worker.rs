mod common;

use std::time::Duration;

use chrono::Utc;
use common::*;
use regsync_core::{JobKind, PartitionId, SourceRow};
use regsync_engine::{
    Consumer, ConsumerPool, EngineConfig, HandlerStatus, RollupEngine, RollupStatus, ScheduledJob, Scheduler,
    WorkMessage, WorkQueue,
};
use regsync_store::{AggregateStore, LockAttempt, RunOutcome};

fn rows_in(state: &str, n: usize, cents: i64) -> Vec<SourceRow> {
    (0..n)
        .map(|i| SourceRow {
            state: state.to_string(),
            ..row(&format!("{state}-{i}"), "Acme", &format!("City {}", i % 3), cents, 0)
        })
        .collect()
}

fn three_states() -> EngineConfig {
    EngineConfig {
        partition_order: vec!["CA".to_string(), "NY".to_string(), "TX".to_string()],
        ..test_config()
    }
}

fn three_state_rows() -> Vec<SourceRow> {
    let mut rows = rows_in("CA", 4, 100);
    rows.extend(rows_in("NY", 5, 200));
    rows.extend(rows_in("TX", 6, 300));
    rows
}

#[tokio::test]
async fn test_fan_out_publishes_partitions_then_sentinel() {
    let h = harness(three_states(), Vec::new());
    let published = Scheduler::new(h.ctx.clone()).fan_out(ScheduledJob::Sync).await.unwrap();
    assert_eq!(published, 4);

    let expected: Vec<String> = [
        WorkMessage::Sync { partition: PartitionId::new("CA") },
        WorkMessage::Sync { partition: PartitionId::new("NY") },
        WorkMessage::Sync { partition: PartitionId::new("TX") },
        WorkMessage::NationalRollup,
    ]
    .iter()
    .map(|m| m.to_payload().unwrap())
    .collect();
    assert_eq!(h.queue.pending().await, expected);
}

#[tokio::test]
async fn test_start_chain_publishes_first_partition_only() {
    let h = harness(three_states(), Vec::new());
    let first = Scheduler::new(h.ctx.clone()).start_chain().await.unwrap();
    assert_eq!(first, Some(PartitionId::new("CA")));
    assert_eq!(
        h.queue.pending().await,
        vec![WorkMessage::Rebuild {
            partition: PartitionId::new("CA"),
            chain: true
        }
        .to_payload()
        .unwrap()]
    );
}

#[tokio::test]
async fn test_chain_rebuilds_every_partition_in_order() {
    let h = harness(
        EngineConfig {
            handoff_verify_attempts: 5,
            handoff_verify_base_ms: 20,
            ..three_states()
        },
        three_state_rows(),
    );
    Scheduler::new(h.ctx.clone()).start_chain().await.unwrap();

    let summary = ConsumerPool::new(h.ctx.clone(), 2).run_until_idle().await.unwrap();
    assert_eq!(summary.handled, 3);
    assert_eq!(summary.failed, 0);
    for (state, count) in [("CA", 4), ("NY", 5), ("TX", 6)] {
        let record = h.aggregates.get(&format!("state#{state}")).await.unwrap().unwrap();
        assert_eq!(record.count, count);
    }

    let entries = h.ctx.runlog.entries_on(Utc::now().date_naive()).await.unwrap();
    let unverified: Vec<&PartitionId> = entries
        .iter()
        .filter(|e| e.outcome == RunOutcome::HandoffUnverified)
        .map(|e| &e.partition)
        .collect();
    assert!(unverified.is_empty(), "unverified hand-offs: {unverified:?}");
    let completed = entries
        .iter()
        .filter(|e| e.job == JobKind::Rebuild && e.outcome == RunOutcome::Completed)
        .count();
    assert_eq!(completed, 3);
}

#[tokio::test]
async fn test_pool_never_runs_a_single_consumer() {
    let h = harness(three_states(), Vec::new());
    assert_eq!(ConsumerPool::new(h.ctx.clone(), 0).size(), 2);
    assert_eq!(ConsumerPool::new(h.ctx.clone(), 1).size(), 2);
    assert_eq!(ConsumerPool::new(h.ctx, 4).size(), 4);
}

#[tokio::test]
async fn test_pool_drains_continuations_and_fan_out() {
    let h = harness(
        EngineConfig {
            time_budget_ms: 0,
            batch_size: 2,
            ..three_states()
        },
        three_state_rows(),
    );
    Scheduler::new(h.ctx.clone()).fan_out(ScheduledJob::Sync).await.unwrap();

    let summary = ConsumerPool::new(h.ctx.clone(), 3).run_until_idle().await.unwrap();
    assert_eq!(summary.failed, 0);
    assert!(summary.handled > 4);
    assert!(h.queue.pending().await.is_empty());
    for (state, count) in [("CA", 4), ("NY", 5), ("TX", 6)] {
        let record = h.aggregates.get(&format!("state#{state}")).await.unwrap().unwrap();
        assert_eq!(record.count, count);
    }
}

#[tokio::test]
async fn test_scheduled_sync_then_rollup_sums_states() {
    let h = harness(three_states(), three_state_rows());
    Scheduler::new(h.ctx.clone()).fan_out(ScheduledJob::Sync).await.unwrap();

    let summary = Consumer::new(h.ctx.clone()).run_until_idle().await.unwrap();
    assert_eq!(summary.handled, 4);

    let nation = h.aggregates.get_assembled("nation#US").await.unwrap().unwrap();
    assert_eq!(nation.count, 15);
    assert_eq!(nation.sum_cents, 4 * 100 + 5 * 200 + 6 * 300);
    assert_eq!(nation.children.len(), 3);
    assert_eq!(nation.children["NY"].count, 5);
}

#[tokio::test]
async fn test_rollup_reports_partitions_mid_pass() {
    let h = harness(
        EngineConfig {
            time_budget_ms: 0,
            batch_size: 1,
            ..three_states()
        },
        three_state_rows(),
    );
    let consumer = Consumer::new(h.ctx.clone());
    let status = consumer.handle(r#"{"kind":"sync","partition":"NY"}"#).await.unwrap();
    assert_eq!(status, HandlerStatus::Continued);

    let report = RollupEngine::new(h.ctx.clone()).rollup().await.unwrap();
    assert_eq!(report.status, RollupStatus::Completed);
    assert_eq!(report.outstanding, vec![PartitionId::new("NY")]);
    assert!(h
        .ctx
        .checkpoints
        .load(JobKind::Sync, &PartitionId::new("NY"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_rollup_skips_when_another_is_running() {
    let h = harness(three_states(), Vec::new());
    let held = h
        .ctx
        .locks
        .acquire("rollup/nation", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(matches!(held, LockAttempt::Acquired(_)));

    let status = Consumer::new(h.ctx.clone())
        .handle(r#"{"kind":"national_rollup"}"#)
        .await
        .unwrap();
    assert_eq!(status, HandlerStatus::Skipped);
    assert!(h.aggregates.get("nation#US").await.unwrap().is_none());
}

#[tokio::test]
async fn test_malformed_payloads() {
    let h = harness(three_states(), three_state_rows());
    let consumer = Consumer::new(h.ctx.clone());

    assert_eq!(consumer.handle("not json at all").await.unwrap(), HandlerStatus::BadMessage);
    assert_eq!(
        consumer.handle(r#"{"kind":"sync","partition":"CA","#).await.unwrap(),
        HandlerStatus::Completed
    );
    assert_eq!(h.aggregates.get("state#CA").await.unwrap().unwrap().count, 4);
    assert_eq!(consumer.handle("sync CA and NY").await.unwrap(), HandlerStatus::BadMessage);
}

#[tokio::test]
async fn test_drain_survives_bad_messages() {
    let h = harness(three_states(), three_state_rows());
    h.queue.publish_raw("garbage".to_string()).await.unwrap();
    h.queue
        .publish(&WorkMessage::Sync {
            partition: PartitionId::new("TX"),
        })
        .await
        .unwrap();

    let summary = Consumer::new(h.ctx.clone()).run_until_idle().await.unwrap();
    assert_eq!(summary.handled, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(h.aggregates.get("state#TX").await.unwrap().unwrap().count, 6);
}
