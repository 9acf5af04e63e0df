//! Snapshot store
//!
//! The delta-sync engine compares a fresh aggregation against the last fully
//! drained one. That "previous" state is one Parquet object per partition:
//!
//! ```text
//! <root>/snapshots/<partition>/aggregate.parquet
//! ```
//!
//! Columns `key`, `scope`, `count` and `sum_cents` are there for ad-hoc
//! inspection; `payload` holds the full record as JSON and is what [`load`]
//! reads back.
//!
//! [`load`]: SnapshotStore::load

use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use regsync_core::{AggregateRecord, PartitionId};
use tracing::{debug, info};

use crate::source::utf8_column;
use crate::{path_safe, Result, StoreError};

pub struct SnapshotStore {
    store: Arc<dyn ObjectStore>,
    root: String,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn ObjectStore>, root: impl Into<String>) -> Self {
        let root = root.into().trim_matches('/').to_string();
        Self { store, root }
    }

    fn path(&self, partition: &PartitionId) -> Path {
        let relative = format!("snapshots/{}/aggregate.parquet", path_safe(partition.as_str()));
        if self.root.is_empty() {
            Path::from(relative)
        } else {
            Path::from(format!("{}/{}", self.root, relative))
        }
    }

    /// Previous snapshot of a partition; empty when none has been written.
    pub async fn load(&self, partition: &PartitionId) -> Result<Vec<AggregateRecord>> {
        let path = self.path(partition);
        let bytes = match self.store.get(&path).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => {
                debug!(partition = %partition, "no snapshot yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let key = path.to_string();
        let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
        let mut records = Vec::new();
        for batch in reader {
            let batch = batch?;
            let payload = utf8_column(&key, &batch, "payload")?;
            for i in 0..batch.num_rows() {
                let record = serde_json::from_str(payload.value(i)).map_err(|e| StoreError::Corrupt {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Overwrite the snapshot of a partition.
    pub async fn replace(&self, partition: &PartitionId, records: &[AggregateRecord]) -> Result<()> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("key", DataType::Utf8, false),
            Field::new("scope", DataType::Utf8, false),
            Field::new("count", DataType::UInt64, false),
            Field::new("sum_cents", DataType::Int64, false),
            Field::new("payload", DataType::Utf8, false),
        ]));

        let payloads = records
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.key.as_str()))),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.scope.as_str()))),
            Arc::new(UInt64Array::from_iter_values(records.iter().map(|r| r.count))),
            Arc::new(Int64Array::from_iter_values(records.iter().map(|r| r.sum_cents))),
            Arc::new(StringArray::from_iter_values(payloads.iter().map(String::as_str))),
        ];
        let batch = RecordBatch::try_new(schema.clone(), columns)?;

        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, schema, None)?;
        writer.write(&batch)?;
        writer.close()?;

        let size = buf.len();
        self.store
            .put(&self.path(partition), PutPayload::from(buf))
            .await?;
        info!(partition = %partition, records = records.len(), bytes = size, "snapshot replaced");
        Ok(())
    }
}
