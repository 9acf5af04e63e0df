//! Parquet source lake
//!
//! Normalized violation rows are laid out hive-style, one directory per
//! partition and month:
//!
//! ```text
//! <root>/source/state=TX/year=2024/month=03/part-<uuid>.parquet
//! ```
//!
//! Columns: `record_id`, `company`, `city`, `state`, `category` (Utf8) and
//! `penalty_cents`, `occurred_at` (Int64). The month directory is derived from
//! `occurred_at`, which lets a single record be fetched by reading one month
//! instead of the whole partition.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use regsync_core::{PartitionId, SourceRow};
use tracing::debug;

use crate::{path_safe, Result, SourceReader, StoreError};

/// Month directory of a timestamp, e.g. `year=2024/month=03`.
pub fn time_location(occurred_at_ms: i64) -> String {
    match DateTime::from_timestamp_millis(occurred_at_ms) {
        Some(at) => at.format("year=%Y/month=%m").to_string(),
        None => "year=unknown".to_string(),
    }
}

/// Month directory for an explicit year and month.
pub fn location_for_month(year: i32, month: u32) -> String {
    format!("year={year:04}/month={month:02}")
}

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("record_id", DataType::Utf8, false),
        Field::new("company", DataType::Utf8, false),
        Field::new("city", DataType::Utf8, false),
        Field::new("state", DataType::Utf8, false),
        Field::new("category", DataType::Utf8, false),
        Field::new("penalty_cents", DataType::Int64, false),
        Field::new("occurred_at", DataType::Int64, false),
    ]))
}

pub struct ParquetSourceReader {
    store: Arc<dyn ObjectStore>,
    root: String,
}

impl ParquetSourceReader {
    pub fn new(store: Arc<dyn ObjectStore>, root: impl Into<String>) -> Self {
        let root = root.into().trim_matches('/').to_string();
        Self { store, root }
    }

    fn partition_prefix(&self, partition: &PartitionId, location: &str) -> Path {
        let mut parts = Vec::new();
        if !self.root.is_empty() {
            parts.push(self.root.clone());
        }
        parts.push("source".to_string());
        parts.push(format!("state={}", path_safe(partition.as_str())));
        let location = location.trim_matches('/');
        if !location.is_empty() {
            parts.push(location.to_string());
        }
        Path::from(parts.join("/"))
    }

    /// Write rows into the lake, one file per (partition, month).
    pub async fn write_rows(&self, rows: &[SourceRow]) -> Result<usize> {
        let mut groups: BTreeMap<(PartitionId, String), Vec<&SourceRow>> = BTreeMap::new();
        for row in rows {
            groups
                .entry((PartitionId::new(&row.state), time_location(row.occurred_at)))
                .or_default()
                .push(row);
        }

        let files = groups.len();
        for ((partition, location), rows) in groups {
            let prefix = self.partition_prefix(&partition, &location);
            let path = Path::from(format!(
                "{}/part-{}.parquet",
                prefix,
                uuid::Uuid::new_v4()
            ));
            let bytes = encode(&rows)?;
            debug!(path = %path, rows = rows.len(), "writing source file");
            self.store.put(&path, PutPayload::from(bytes)).await?;
        }
        Ok(files)
    }

    async fn read_under(&self, prefix: &Path) -> Result<Vec<SourceRow>> {
        let metas: Vec<object_store::ObjectMeta> =
            self.store.list(Some(prefix)).try_collect().await?;

        let mut rows = Vec::new();
        for meta in metas {
            if !meta.location.as_ref().ends_with(".parquet") {
                continue;
            }
            let bytes = self.store.get(&meta.location).await?.bytes().await?;
            rows.extend(decode(meta.location.as_ref(), bytes)?);
        }
        Ok(rows)
    }
}

#[async_trait]
impl SourceReader for ParquetSourceReader {
    async fn scan_partition(&self, partition: &PartitionId) -> Result<Vec<SourceRow>> {
        self.read_under(&self.partition_prefix(partition, "")).await
    }

    async fn fetch_record(
        &self,
        partition: &PartitionId,
        location: &str,
        record_id: &str,
    ) -> Result<Option<SourceRow>> {
        let rows = self
            .read_under(&self.partition_prefix(partition, location))
            .await?;
        Ok(rows.into_iter().find(|r| r.record_id == record_id))
    }
}

fn encode(rows: &[&SourceRow]) -> Result<Vec<u8>> {
    let schema = schema();
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.record_id.as_str()))),
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.company.as_str()))),
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.city.as_str()))),
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.state.as_str()))),
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.category.as_str()))),
        Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.penalty_cents))),
        Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.occurred_at))),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns)?;

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buf)
}

fn decode(key: &str, bytes: Bytes) -> Result<Vec<SourceRow>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        let record_id = utf8_column(key, &batch, "record_id")?;
        let company = utf8_column(key, &batch, "company")?;
        let city = utf8_column(key, &batch, "city")?;
        let state = utf8_column(key, &batch, "state")?;
        let category = utf8_column(key, &batch, "category")?;
        let penalty = int64_column(key, &batch, "penalty_cents")?;
        let occurred = int64_column(key, &batch, "occurred_at")?;
        for i in 0..batch.num_rows() {
            rows.push(SourceRow {
                record_id: record_id.value(i).to_string(),
                company: company.value(i).to_string(),
                city: city.value(i).to_string(),
                state: state.value(i).to_string(),
                category: category.value(i).to_string(),
                penalty_cents: penalty.value(i),
                occurred_at: occurred.value(i),
            });
        }
    }
    Ok(rows)
}

pub(crate) fn utf8_column<'a>(key: &str, batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("missing or non-utf8 column {name}"),
        })
}

pub(crate) fn int64_column<'a>(key: &str, batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("missing or non-int64 column {name}"),
        })
}
