//! Batched writes to the aggregate store.

use regsync_core::{chunk_record, AggregateRecord};
use regsync_observability::metrics;
use regsync_store::{AggregateStore, StoreError};
use tracing::{debug, error, warn};

use crate::config::EngineConfig;
use crate::error::Result;

/// Lay records out for the destination, splitting any that outgrow the
/// ceiling. Output is ordered by key.
pub fn chunk_all(records: &[AggregateRecord], config: &EngineConfig) -> Result<Vec<AggregateRecord>> {
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let family = chunk_record(
            record,
            config.record_ceiling_bytes,
            config.reserved_metadata_bytes,
        )?;
        if family.len() > 1 {
            debug!(key = %record.key, chunks = family.len(), "record split across overflow chunks");
            metrics::OVERFLOW_CHUNKS_TOTAL
                .with_label_values(&[record.scope.as_str()])
                .inc_by(family.len() as u64 - 1);
        }
        out.extend(family);
    }
    out.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(out)
}

/// Upsert one batch, retrying with exponential backoff.
pub async fn write_batch_with_retry(
    store: &dyn AggregateStore,
    batch: &[AggregateRecord],
    config: &EngineConfig,
) -> std::result::Result<(), StoreError> {
    let attempts = config.batch_retries.max(1);
    let mut attempt = 0;
    loop {
        match store.batch_upsert(batch).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt + 1 < attempts => {
                let backoff = config.retry_backoff(attempt);
                warn!(
                    records = batch.len(),
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "batch write failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                error!(
                    records = batch.len(),
                    attempts = attempts,
                    first_key = batch.first().map(|r| r.key.as_str()).unwrap_or(""),
                    error = %e,
                    "batch write failed after retries"
                );
                return Err(e);
            }
        }
    }
}

/// Write every record in batches; the first batch that exhausts its retries
/// fails the call.
pub async fn write_all(
    store: &dyn AggregateStore,
    records: &[AggregateRecord],
    config: &EngineConfig,
) -> Result<usize> {
    for batch in records.chunks(config.batch_size) {
        write_batch_with_retry(store, batch, config).await?;
    }
    Ok(records.len())
}
