//! Checkpoint and lock payloads
//!
//! Both are persisted as JSON in the checkpoint/lock store. A checkpoint
//! exists only while a pass is incomplete. A lock is advisory: once its TTL
//! has elapsed any later pass may reclaim it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::partition::PartitionId;

/// Job class a checkpoint or lock belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sync,
    Rebuild,
    Manifest,
    Rollup,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Sync => "sync",
            JobKind::Rebuild => "rebuild",
            JobKind::Manifest => "manifest",
            JobKind::Rollup => "rollup",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resume cursor for a suspended pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job: JobKind,
    pub partition: PartitionId,
    /// Opaque position; each engine decides its meaning
    pub cursor: String,
    pub items_processed: u64,
    pub saved_at: i64,
    /// Engine-specific resume state
    #[serde(default)]
    pub state: serde_json::Value,
}

/// Advisory mutual-exclusion marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub holder: String,
    pub acquired_at: i64,
    pub ttl_ms: i64,
}

impl Lock {
    pub fn expires_at(&self) -> i64 {
        self.acquired_at + self.ttl_ms
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_expiry() {
        let lock = Lock {
            holder: "worker-1".to_string(),
            acquired_at: 1_000,
            ttl_ms: 500,
        };
        assert!(!lock.is_expired(1_499));
        assert!(lock.is_expired(1_500));
    }

    #[test]
    fn test_checkpoint_state_defaults_to_null() {
        let json = r#"{"job":"sync","partition":"TX","cursor":"25","items_processed":25,"saved_at":7}"#;
        let checkpoint: Checkpoint = serde_json::from_str(json).unwrap();
        assert_eq!(checkpoint.job, JobKind::Sync);
        assert_eq!(checkpoint.partition, PartitionId::new("TX"));
        assert!(checkpoint.state.is_null());
    }
}
