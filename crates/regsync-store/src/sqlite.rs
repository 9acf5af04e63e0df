//! SQLite aggregate store and recent mirror
//!
//! Single-node backend for the read path. One table holds aggregate records
//! (primaries and overflow chunks alike, keyed by their full key); a second
//! holds the mirrored recent records of every manifest.
//!
//! ## Usage
//!
//! ```ignore
//! // File-based
//! let store = SqliteAggregateStore::new("regsync.db").await?;
//!
//! // In-memory (tests)
//! let store = SqliteAggregateStore::new_in_memory().await?;
//! ```
//!
//! Queries are runtime `sqlx::query` calls, so the crate builds without a
//! `DATABASE_URL`. Migrations run on open via `sqlx::migrate!`.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use regsync_core::AggregateRecord;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::{AggregateStore, MirroredRecord, RecentMirror, Result, StoreError};

pub struct SqliteAggregateStore {
    pool: SqlitePool,
}

impl SqliteAggregateStore {
    /// Open (or create) a database file.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory database for tests.
    ///
    /// Every connection to `sqlite::memory:` opens its own database, so the
    /// pool is held to a single connection.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    fn decode_record(row: &SqliteRow) -> Result<AggregateRecord> {
        let payload: String = row.try_get("payload")?;
        let key: String = row.try_get("key")?;
        serde_json::from_str(&payload).map_err(|e| StoreError::Corrupt {
            key,
            reason: e.to_string(),
        })
    }
}

const UPSERT_AGGREGATE: &str = "INSERT INTO aggregates (key, partition_id, scope, payload, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT(key) DO UPDATE SET
        partition_id = excluded.partition_id,
        scope = excluded.scope,
        payload = excluded.payload,
        updated_at = excluded.updated_at";

#[async_trait]
impl AggregateStore for SqliteAggregateStore {
    async fn upsert(&self, record: &AggregateRecord) -> Result<()> {
        self.batch_upsert(std::slice::from_ref(record)).await
    }

    async fn batch_upsert(&self, records: &[AggregateRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(UPSERT_AGGREGATE)
                .bind(&record.key)
                .bind(record.partition.as_str())
                .bind(record.scope.as_str())
                .bind(serde_json::to_string(record)?)
                .bind(record.updated_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<AggregateRecord>> {
        let row = sqlx::query("SELECT key, payload FROM aggregates WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode_record).transpose()
    }

    async fn query_by_prefix(&self, prefix: &str) -> Result<Vec<AggregateRecord>> {
        // substr keeps '%' and '_' in keys from acting as LIKE wildcards
        let rows = sqlx::query(
            "SELECT key, payload FROM aggregates
             WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::decode_record).collect()
    }
}

#[async_trait]
impl RecentMirror for SqliteAggregateStore {
    async fn delete_batch(&self, manifest_key: &str, record_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in record_ids {
            sqlx::query("DELETE FROM recent_mirror WHERE manifest_key = ?1 AND record_id = ?2")
                .bind(manifest_key)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn put_batch(&self, records: &[MirroredRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                "INSERT INTO recent_mirror (manifest_key, record_id, rank, payload)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(manifest_key, record_id) DO UPDATE SET
                    rank = excluded.rank,
                    payload = excluded.payload",
            )
            .bind(&record.manifest_key)
            .bind(&record.row.record_id)
            .bind(record.rank as i64)
            .bind(serde_json::to_string(&record.row)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list(&self, manifest_key: &str) -> Result<Vec<MirroredRecord>> {
        let rows = sqlx::query(
            "SELECT record_id, rank, payload FROM recent_mirror
             WHERE manifest_key = ?1
             ORDER BY rank, record_id",
        )
        .bind(manifest_key)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                let rank: i64 = r.try_get("rank")?;
                let payload: String = r.try_get("payload")?;
                let record_id: String = r.try_get("record_id")?;
                let row = serde_json::from_str(&payload).map_err(|e| StoreError::Corrupt {
                    key: format!("{manifest_key}/{record_id}"),
                    reason: e.to_string(),
                })?;
                Ok(MirroredRecord {
                    manifest_key: manifest_key.to_string(),
                    rank: rank as u32,
                    row,
                })
            })
            .collect()
    }
}
