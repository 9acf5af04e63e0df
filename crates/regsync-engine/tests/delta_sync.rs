mod common;

use std::sync::Arc;

use common::*;
use regsync_core::{now_ms, Checkpoint, JobKind, PartitionId, SourceRow};
use regsync_engine::{
    aggregate_rows, Consumer, DeltaSyncEngine, EngineConfig, HandlerStatus, RebuildEngine, SyncStatus,
    WorkMessage, WorkQueue,
};
use regsync_store::{AggregateStore, InMemorySource, RecentMirror, SourceReader};

fn tx() -> PartitionId {
    PartitionId::new("TX")
}

fn suspending_config() -> EngineConfig {
    EngineConfig {
        time_budget_ms: 0,
        batch_size: 2,
        ..test_config()
    }
}

#[tokio::test]
async fn test_first_sync_writes_everything_and_drains() {
    let rows = spread_rows(24);
    let h = harness(test_config(), rows.clone());

    let report = DeltaSyncEngine::new(h.ctx.clone()).sync_partition(&tx()).await.unwrap();
    assert_eq!(report.status, SyncStatus::Drained);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.updated, report.delta_len);

    let expected = expected_records(&h.ctx, &tx(), &rows).await;
    assert_same_records(&h.aggregates.all().await, &expected);
    assert_eq!(h.ctx.snapshots.load(&tx()).await.unwrap().len(), expected.len());
    assert!(h.ctx.checkpoints.load(JobKind::Sync, &tx()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unchanged_source_writes_nothing() {
    let h = harness(test_config(), spread_rows(24));
    let engine = DeltaSyncEngine::new(h.ctx.clone());

    engine.sync_partition(&tx()).await.unwrap();
    let writes = h.aggregates.write_count();

    let again = engine.sync_partition(&tx()).await.unwrap();
    assert_eq!(again.status, SyncStatus::Drained);
    assert_eq!(again.updated, 0);
    assert_eq!(again.delta_len, 0);
    assert_eq!(h.aggregates.write_count(), writes);
}

#[tokio::test]
async fn test_only_changed_records_are_written() {
    let h = harness(test_config(), spread_rows(24));
    let engine = DeltaSyncEngine::new(h.ctx.clone());
    engine.sync_partition(&tx()).await.unwrap();

    h.source
        .insert([row("OSHA-20240316-9999", "Company 0", "City 0", 500, 1_710_547_200_000)])
        .await;
    let report = engine.sync_partition(&tx()).await.unwrap();

    // state#TX, city#TX#City 0 and the company record
    assert_eq!(report.updated, 3);
    assert!(report.skipped > 0);
    assert_eq!(h.aggregates.get("state#TX").await.unwrap().unwrap().count, 25);
}

#[tokio::test]
async fn test_vanished_entities_are_not_retracted() {
    let h = harness(test_config(), vec![row("1", "Acme", "Austin", 100, 0)]);
    DeltaSyncEngine::new(h.ctx.clone()).sync_partition(&tx()).await.unwrap();

    let mut ctx = h.ctx.clone();
    ctx.source = Arc::new(InMemorySource::with_rows(vec![row("2", "Globex", "Dallas", 100, 0)]));
    let report = DeltaSyncEngine::new(ctx).sync_partition(&tx()).await.unwrap();
    assert_eq!(report.status, SyncStatus::Drained);

    assert!(h.aggregates.get("city#TX#Austin").await.unwrap().is_some());
    assert!(h.aggregates.get("city#TX#Dallas").await.unwrap().is_some());
}

#[tokio::test]
async fn test_suspend_resume_cycles_converge_on_direct_aggregate() {
    let rows = spread_rows(30);
    let h = harness(suspending_config(), rows.clone());

    let first = DeltaSyncEngine::new(h.ctx.clone()).sync_partition(&tx()).await.unwrap();
    assert_eq!(first.status, SyncStatus::Suspended { offset: 2 });
    assert_eq!(first.updated, 2);
    assert!(h.ctx.snapshots.load(&tx()).await.unwrap().is_empty());
    assert_eq!(
        h.queue.pending().await,
        vec![WorkMessage::Sync { partition: tx() }.to_payload().unwrap()]
    );

    let summary = Consumer::new(h.ctx.clone()).run_until_idle().await.unwrap();
    assert_eq!(summary.failed, 0);
    assert!(summary.handled > 1);

    let expected = expected_records(&h.ctx, &tx(), &rows).await;
    assert_same_records(&h.aggregates.all().await, &expected);
    assert_eq!(h.ctx.snapshots.load(&tx()).await.unwrap().len(), expected.len());
    assert!(h.ctx.checkpoints.load(JobKind::Sync, &tx()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_source_change_between_invocations_restarts_delta() {
    let h = harness(suspending_config(), spread_rows(30));
    let engine = DeltaSyncEngine::new(h.ctx.clone());

    let first = engine.sync_partition(&tx()).await.unwrap();
    assert_eq!(first.status, SyncStatus::Suspended { offset: 2 });
    let second = engine.sync_partition(&tx()).await.unwrap();
    assert_eq!(second.status, SyncStatus::Suspended { offset: 4 });

    h.source
        .insert([row("OSHA-20240320-7777", "New Co", "New City", 700, 1_710_892_800_000)])
        .await;
    let third = engine.sync_partition(&tx()).await.unwrap();
    assert_eq!(third.status, SyncStatus::Suspended { offset: 2 });

    while h.queue.receive().await.unwrap().is_some() {}
    loop {
        let report = engine.sync_partition(&tx()).await.unwrap();
        if report.status == SyncStatus::Drained {
            break;
        }
    }

    let rows = h.ctx.source.scan_partition(&tx()).await.unwrap();
    let expected = expected_records(&h.ctx, &tx(), &rows).await;
    assert_same_records(&h.aggregates.all().await, &expected);
}

#[tokio::test]
async fn test_failed_batches_keep_previous_snapshot() {
    let (ctx, _queue) = context_with(
        EngineConfig {
            batch_retries: 1,
            ..test_config()
        },
        Arc::new(InMemorySource::with_rows(spread_rows(12))),
        Arc::new(FailingStore::default()),
    );

    let report = DeltaSyncEngine::new(ctx.clone()).sync_partition(&tx()).await.unwrap();
    assert_eq!(report.status, SyncStatus::Partial);
    assert!(report.failed_batches > 0);
    assert_eq!(report.updated, 0);
    assert!(ctx.snapshots.load(&tx()).await.unwrap().is_empty());

    let status = Consumer::new(ctx)
        .handle(r#"{"kind":"sync","partition":"TX"}"#)
        .await
        .unwrap();
    assert_eq!(status, HandlerStatus::Partial);
}

#[tokio::test]
async fn test_sync_refreshes_recent_mirror() {
    let h = harness(
        test_config(),
        vec![row("OSHA-20240315-1", "Acme Corp", "Austin", 100, 1_710_460_800_000)],
    );
    RebuildEngine::new(h.ctx.clone()).rebuild_partition(&tx(), false).await.unwrap();

    h.source
        .insert([row("OSHA-20240316-2", "Acme Corp", "Austin", 200, 1_710_547_200_000)])
        .await;
    let report = DeltaSyncEngine::new(h.ctx.clone()).sync_partition(&tx()).await.unwrap();
    assert_eq!(report.status, SyncStatus::Drained);

    let mirrored: Vec<String> = h
        .mirror
        .list("state#TX/acme/osha")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.row.record_id)
        .collect();
    assert_eq!(mirrored, vec!["OSHA-20240316-2", "OSHA-20240315-1"]);
}

#[tokio::test]
async fn test_suspended_sync_leaves_mirror_alone() {
    let h = harness(suspending_config(), spread_rows(30));

    let report = DeltaSyncEngine::new(h.ctx.clone()).sync_partition(&tx()).await.unwrap();
    assert!(matches!(report.status, SyncStatus::Suspended { .. }));
    assert!(h.mirror.list("state#TX/company-0/osha").await.unwrap().is_empty());

    Consumer::new(h.ctx.clone()).run_until_idle().await.unwrap();
    assert_eq!(h.mirror.list("state#TX/company-0/osha").await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_oversized_records_are_chunked_and_reassemble() {
    let rows: Vec<SourceRow> = (0..700)
        .map(|i| {
            row(
                &format!("OSHA-20240315-{i:04}"),
                &format!("Company {}", i % 4),
                &format!("City {:03}", i % 200),
                100,
                1_710_460_800_000 + i as i64,
            )
        })
        .collect();
    let config = EngineConfig {
        record_ceiling_bytes: 4_096,
        ..test_config()
    };
    let h = harness(config, rows.clone());

    let report = DeltaSyncEngine::new(h.ctx.clone()).sync_partition(&tx()).await.unwrap();
    assert_eq!(report.status, SyncStatus::Drained);

    let stored = h.aggregates.all().await;
    assert!(stored.iter().any(|r| r.key.starts_with("state#TX#chunk")));
    for record in &stored {
        let size = serde_json::to_vec(record).unwrap().len();
        assert!(size <= 4_096, "{} is {} bytes", record.key, size);
    }

    let direct = aggregate_rows(&tx(), &rows, &h.ctx.aliases, 0).await.unwrap();
    let state = h.aggregates.get_assembled("state#TX").await.unwrap().unwrap();
    assert_eq!(state.count, 700);
    assert_eq!(state.children.len(), 200);
    assert_eq!(state.children, direct.state.children);
    for company in direct.companies.values() {
        let assembled = h.aggregates.get_assembled(&company.key).await.unwrap().unwrap();
        assert_eq!(assembled.children, company.children);
        assert_eq!(assembled.count, company.count);
    }
}

#[tokio::test]
async fn test_unreadable_checkpoint_state_restarts_delta() {
    let h = harness(suspending_config(), spread_rows(30));
    h.ctx
        .checkpoints
        .save(&Checkpoint {
            job: JobKind::Sync,
            partition: tx(),
            cursor: "6".to_string(),
            items_processed: 6,
            saved_at: now_ms(),
            state: serde_json::json!("garbage"),
        })
        .await
        .unwrap();

    let report = DeltaSyncEngine::new(h.ctx.clone()).sync_partition(&tx()).await.unwrap();
    assert_eq!(report.status, SyncStatus::Suspended { offset: 2 });
    assert_eq!(report.updated, 2);
}
