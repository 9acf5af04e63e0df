use regsync_core::{chunk_record, AggregateRecord, PartitionId, Scope, SourceRow, Stats};
use regsync_store::{AggregateStore, MirroredRecord, RecentMirror, SqliteAggregateStore};

fn state_with_cities(n: usize) -> AggregateRecord {
    let mut state = AggregateRecord::new(Scope::State, PartitionId::new("TX"), "TX", 1_000);
    for i in 0..n {
        let stats = Stats {
            count: (i % 7 + 1) as u64,
            sum_cents: (i as i64) * 1_000,
        };
        state.count += stats.count;
        state.sum_cents += stats.sum_cents;
        state.children.insert(format!("City {i:03}"), stats);
    }
    state
}

fn row(id: &str) -> SourceRow {
    SourceRow {
        record_id: id.to_string(),
        company: "Acme".to_string(),
        city: "Austin".to_string(),
        state: "TX".to_string(),
        category: "osha".to_string(),
        penalty_cents: 100,
        occurred_at: 0,
    }
}

#[tokio::test]
async fn test_file_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("regsync.db");

    let record = state_with_cities(3);
    {
        let store = SqliteAggregateStore::new(&path).await.unwrap();
        store.upsert(&record).await.unwrap();
    }

    let store = SqliteAggregateStore::new(&path).await.unwrap();
    assert_eq!(store.get("state#TX").await.unwrap(), Some(record));
    assert!(store.get("state#CA").await.unwrap().is_none());
}

#[tokio::test]
async fn test_chunked_record_reassembles() {
    let store = SqliteAggregateStore::new_in_memory().await.unwrap();
    let record = state_with_cities(300);
    let family = chunk_record(&record, 2_048, 256).unwrap();
    assert!(family.len() > 1);

    store.batch_upsert(&family).await.unwrap();
    let assembled = store.get_assembled("state#TX").await.unwrap().unwrap();
    assert_eq!(assembled.children, record.children);
    assert_eq!(assembled.count, record.count);
    assert_eq!(assembled.chunk, None);
}

#[tokio::test]
async fn test_prefix_query_treats_wildcards_literally() {
    let store = SqliteAggregateStore::new_in_memory().await.unwrap();
    let tx = PartitionId::new("TX");
    store
        .batch_upsert(&[
            AggregateRecord::new(Scope::City, tx.clone(), "a_b", 0),
            AggregateRecord::new(Scope::City, tx.clone(), "axb", 0),
            AggregateRecord::new(Scope::Company, tx, "acme", 0),
        ])
        .await
        .unwrap();

    let hits = store.query_by_prefix("city#TX#a_").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entity, "a_b");
    assert_eq!(store.query_by_prefix("city#TX#").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_recent_mirror_replaces_and_orders_by_rank() {
    let store = SqliteAggregateStore::new_in_memory().await.unwrap();
    let key = "TX/acme/osha";
    let mirrored = |id: &str, rank: u32| MirroredRecord {
        manifest_key: key.to_string(),
        rank,
        row: row(id),
    };

    store
        .put_batch(&[mirrored("r2", 1), mirrored("r1", 0), mirrored("r3", 2)])
        .await
        .unwrap();
    store.delete_batch(key, &["r1".to_string()]).await.unwrap();
    store.put_batch(&[mirrored("r9", 0)]).await.unwrap();

    let ids: Vec<String> = store
        .list(key)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.row.record_id)
        .collect();
    assert_eq!(ids, vec!["r9", "r2", "r3"]);
    assert!(store.list("TX/other/osha").await.unwrap().is_empty());
}
