//! Run log
//!
//! An append-only trail of pass lifecycle events, one small JSON object per
//! event:
//!
//! ```text
//! runlog/<YYYY-MM-DD>/<millis>-<job>-<partition>-<uuid>.json
//! ```
//!
//! Operators read it to see what ran; the rebuild engine reads it to confirm
//! that a chained hand-off was picked up by the next partition.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use regsync_core::{now_ms, JobKind, PartitionId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{get_typed, path_safe, put_typed, JsonStore, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Started,
    Completed,
    Suspended,
    Reverted,
    Failed,
    LockContended,
    /// A chained hand-off whose successor never reported in
    HandoffUnverified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub job: JobKind,
    pub partition: PartitionId,
    pub outcome: RunOutcome,
    #[serde(default)]
    pub detail: String,
    pub at: i64,
}

pub struct RunLog {
    json: Arc<dyn JsonStore>,
}

impl RunLog {
    pub fn new(json: Arc<dyn JsonStore>) -> Self {
        Self { json }
    }

    fn day_prefix(day: NaiveDate) -> String {
        format!("runlog/{}/", day.format("%Y-%m-%d"))
    }

    fn day_of(ms: i64) -> NaiveDate {
        DateTime::<Utc>::from_timestamp_millis(ms)
            .unwrap_or_default()
            .date_naive()
    }

    pub async fn record(
        &self,
        job: JobKind,
        partition: &PartitionId,
        outcome: RunOutcome,
        detail: impl Into<String>,
    ) -> Result<RunLogEntry> {
        let entry = RunLogEntry {
            job,
            partition: partition.clone(),
            outcome,
            detail: detail.into(),
            at: now_ms(),
        };
        let key = format!(
            "{}{:013}-{}-{}-{}.json",
            Self::day_prefix(Self::day_of(entry.at)),
            entry.at,
            job,
            path_safe(partition.as_str()),
            uuid::Uuid::new_v4()
        );
        put_typed(self.json.as_ref(), &key, &entry).await?;
        debug!(job = %job, partition = %partition, outcome = ?outcome, "run log entry");
        Ok(entry)
    }

    /// Entries written on one UTC day, oldest first.
    pub async fn entries_on(&self, day: NaiveDate) -> Result<Vec<RunLogEntry>> {
        let mut entries = Vec::new();
        for key in self.json.list_keys(&Self::day_prefix(day)).await? {
            if let Some(entry) = get_typed::<RunLogEntry>(self.json.as_ref(), &key).await? {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e| e.at);
        Ok(entries)
    }

    /// Whether `job` logged a start for `partition` at or after `since_ms`.
    pub async fn started_since(&self, job: JobKind, partition: &PartitionId, since_ms: i64) -> Result<bool> {
        let marker = format!("-{}-{}-", job, path_safe(partition.as_str()));
        let last_day = Self::day_of(now_ms().max(since_ms));
        let mut day = Self::day_of(since_ms);

        while day <= last_day {
            for key in self.json.list_keys(&Self::day_prefix(day)).await? {
                if !key.contains(&marker) {
                    continue;
                }
                let Some(entry) = get_typed::<RunLogEntry>(self.json.as_ref(), &key).await? else {
                    continue;
                };
                if entry.outcome == RunOutcome::Started && entry.at >= since_ms {
                    return Ok(true);
                }
            }
            day += ChronoDuration::days(1);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectJsonStore;
    use object_store::memory::InMemory;

    fn runlog() -> RunLog {
        RunLog::new(Arc::new(ObjectJsonStore::new(Arc::new(InMemory::new()), "")))
    }

    #[tokio::test]
    async fn test_record_and_list_today() {
        let log = runlog();
        let tx = PartitionId::new("TX");
        log.record(JobKind::Rebuild, &tx, RunOutcome::Started, "").await.unwrap();
        log.record(JobKind::Rebuild, &tx, RunOutcome::Completed, "3 cities").await.unwrap();

        let today = Utc::now().date_naive();
        let entries = log.entries_on(today).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].outcome, RunOutcome::Started);
        assert_eq!(entries[1].detail, "3 cities");
    }

    #[tokio::test]
    async fn test_started_since_matches_job_and_partition() {
        let log = runlog();
        let before = now_ms();
        log.record(JobKind::Sync, &PartitionId::new("UT"), RunOutcome::Started, "")
            .await
            .unwrap();
        log.record(JobKind::Rebuild, &PartitionId::new("UT"), RunOutcome::Completed, "")
            .await
            .unwrap();

        let ut = PartitionId::new("UT");
        assert!(log.started_since(JobKind::Sync, &ut, before).await.unwrap());
        assert!(!log.started_since(JobKind::Rebuild, &ut, before).await.unwrap());
        assert!(!log.started_since(JobKind::Sync, &PartitionId::new("TX"), before).await.unwrap());
        assert!(!log.started_since(JobKind::Sync, &ut, now_ms() + 60_000).await.unwrap());
    }
}
