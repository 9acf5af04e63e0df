//! Engine Configuration
//!
//! ## EngineConfig
//!
//! Controls how long a pass may run, how large a record may grow and how the
//! engines pace their writes:
//!
//! - **time_budget_ms**: voluntary-exit budget per invocation, kept well below
//!   the host's hard limit (default: 13 min)
//! - **record_ceiling_bytes**: hard serialized-size ceiling of one destination
//!   record (default: 400KB)
//! - **reserved_metadata_bytes**: held back from every record for chunk tags
//!   (default: 256)
//! - **rebuild_soft_warn_bytes** / **rebuild_hard_ceiling_bytes**: projected
//!   commit size at which a rebuild suspends, and at which it reverts its last
//!   child (default: 3MB / 3.5MB)
//! - **batch_size**: records per batch write (default: 25)
//! - **batch_retries** / **retry_base_ms**: attempts per batch with exponential
//!   backoff `retry_base_ms * 2^attempt` (default: 3 / 100ms)
//! - **lock_ttl_ms**: advisory lock lifetime (default: 15 min)
//! - **handoff_verify_attempts** / **handoff_verify_base_ms**: how long a
//!   chained rebuild polls for its successor (default: 5 / 1s)
//! - **manifest_depth**: recent records per manifest (default: 5)
//! - **partition_order**: declared order for sequential rebuilds
//!
//! ## Usage
//!
//! ```ignore
//! use regsync_engine::EngineConfig;
//!
//! // Defaults overlaid with REGSYNC_* environment variables
//! let config = EngineConfig::from_env()?;
//!
//! // Tests
//! let config = EngineConfig {
//!     time_budget_ms: 0,
//!     batch_size: 10,
//!     ..Default::default()
//! };
//! ```

use std::str::FromStr;
use std::time::Duration;

use regsync_core::{PartitionId, DEFAULT_PARTITION_ORDER, MAX_RECENT};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Identifies this process in lock holders (default: random)
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    #[serde(default = "default_time_budget_ms")]
    pub time_budget_ms: u64,

    #[serde(default = "default_record_ceiling_bytes")]
    pub record_ceiling_bytes: usize,

    #[serde(default = "default_reserved_metadata_bytes")]
    pub reserved_metadata_bytes: usize,

    #[serde(default = "default_rebuild_soft_warn_bytes")]
    pub rebuild_soft_warn_bytes: usize,

    #[serde(default = "default_rebuild_hard_ceiling_bytes")]
    pub rebuild_hard_ceiling_bytes: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_retries")]
    pub batch_retries: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    #[serde(default = "default_handoff_verify_attempts")]
    pub handoff_verify_attempts: u32,

    #[serde(default = "default_handoff_verify_base_ms")]
    pub handoff_verify_base_ms: u64,

    #[serde(default = "default_manifest_depth")]
    pub manifest_depth: usize,

    #[serde(default = "default_alias_cache_capacity")]
    pub alias_cache_capacity: usize,

    #[serde(default = "default_alias_cache_ttl_ms")]
    pub alias_cache_ttl_ms: i64,

    #[serde(default = "default_partition_order")]
    pub partition_order: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            time_budget_ms: default_time_budget_ms(),
            record_ceiling_bytes: default_record_ceiling_bytes(),
            reserved_metadata_bytes: default_reserved_metadata_bytes(),
            rebuild_soft_warn_bytes: default_rebuild_soft_warn_bytes(),
            rebuild_hard_ceiling_bytes: default_rebuild_hard_ceiling_bytes(),
            batch_size: default_batch_size(),
            batch_retries: default_batch_retries(),
            retry_base_ms: default_retry_base_ms(),
            lock_ttl_ms: default_lock_ttl_ms(),
            handoff_verify_attempts: default_handoff_verify_attempts(),
            handoff_verify_base_ms: default_handoff_verify_base_ms(),
            manifest_depth: default_manifest_depth(),
            alias_cache_capacity: default_alias_cache_capacity(),
            alias_cache_ttl_ms: default_alias_cache_ttl_ms(),
            partition_order: default_partition_order(),
        }
    }
}

fn default_worker_id() -> String {
    format!("worker-{}", uuid::Uuid::new_v4())
}

fn default_time_budget_ms() -> u64 {
    13 * 60 * 1000 // 13 minutes, under a 15 minute host limit
}

fn default_record_ceiling_bytes() -> usize {
    400 * 1024 // 400KB item limit
}

fn default_reserved_metadata_bytes() -> usize {
    regsync_core::DEFAULT_RESERVED_METADATA_BYTES
}

fn default_rebuild_soft_warn_bytes() -> usize {
    3 * 1024 * 1024
}

fn default_rebuild_hard_ceiling_bytes() -> usize {
    3 * 1024 * 1024 + 512 * 1024
}

fn default_batch_size() -> usize {
    25 // destination batch-write limit
}

fn default_batch_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    100
}

fn default_lock_ttl_ms() -> u64 {
    15 * 60 * 1000
}

fn default_handoff_verify_attempts() -> u32 {
    5
}

fn default_handoff_verify_base_ms() -> u64 {
    1000
}

fn default_manifest_depth() -> usize {
    MAX_RECENT
}

fn default_alias_cache_capacity() -> usize {
    10_000
}

fn default_alias_cache_ttl_ms() -> i64 {
    10 * 60 * 1000
}

fn default_partition_order() -> Vec<String> {
    DEFAULT_PARTITION_ORDER.iter().map(|p| p.to_string()).collect()
}

impl EngineConfig {
    /// Defaults overlaid with `REGSYNC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(id) = std::env::var("REGSYNC_WORKER_ID") {
            config.worker_id = id;
        }
        set_from_env("REGSYNC_TIME_BUDGET_MS", &mut config.time_budget_ms)?;
        set_from_env("REGSYNC_RECORD_CEILING_BYTES", &mut config.record_ceiling_bytes)?;
        set_from_env("REGSYNC_RESERVED_METADATA_BYTES", &mut config.reserved_metadata_bytes)?;
        set_from_env("REGSYNC_REBUILD_SOFT_WARN_BYTES", &mut config.rebuild_soft_warn_bytes)?;
        set_from_env("REGSYNC_REBUILD_HARD_CEILING_BYTES", &mut config.rebuild_hard_ceiling_bytes)?;
        set_from_env("REGSYNC_BATCH_SIZE", &mut config.batch_size)?;
        set_from_env("REGSYNC_BATCH_RETRIES", &mut config.batch_retries)?;
        set_from_env("REGSYNC_RETRY_BASE_MS", &mut config.retry_base_ms)?;
        set_from_env("REGSYNC_LOCK_TTL_MS", &mut config.lock_ttl_ms)?;
        set_from_env("REGSYNC_HANDOFF_VERIFY_ATTEMPTS", &mut config.handoff_verify_attempts)?;
        set_from_env("REGSYNC_HANDOFF_VERIFY_BASE_MS", &mut config.handoff_verify_base_ms)?;
        set_from_env("REGSYNC_MANIFEST_DEPTH", &mut config.manifest_depth)?;
        set_from_env("REGSYNC_ALIAS_CACHE_CAPACITY", &mut config.alias_cache_capacity)?;
        set_from_env("REGSYNC_ALIAS_CACHE_TTL_MS", &mut config.alias_cache_ttl_ms)?;
        if let Ok(order) = std::env::var("REGSYNC_PARTITION_ORDER") {
            config.partition_order = order
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EngineError::Config("batch_size must be at least 1".to_string()));
        }
        if self.record_ceiling_bytes <= self.reserved_metadata_bytes {
            return Err(EngineError::Config(format!(
                "record_ceiling_bytes ({}) must exceed reserved_metadata_bytes ({})",
                self.record_ceiling_bytes, self.reserved_metadata_bytes
            )));
        }
        if self.rebuild_soft_warn_bytes > self.rebuild_hard_ceiling_bytes {
            return Err(EngineError::Config(format!(
                "rebuild_soft_warn_bytes ({}) must not exceed rebuild_hard_ceiling_bytes ({})",
                self.rebuild_soft_warn_bytes, self.rebuild_hard_ceiling_bytes
            )));
        }
        if self.manifest_depth == 0 || self.manifest_depth > MAX_RECENT {
            return Err(EngineError::Config(format!(
                "manifest_depth must be between 1 and {MAX_RECENT}"
            )));
        }
        if self.alias_cache_capacity == 0 {
            return Err(EngineError::Config("alias_cache_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_ms.saturating_mul(2_u64.saturating_pow(attempt)))
    }

    pub fn handoff_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.handoff_verify_base_ms
                .saturating_mul(2_u64.saturating_pow(attempt)),
        )
    }

    pub fn partitions(&self) -> Vec<PartitionId> {
        self.partition_order.iter().map(PartitionId::new).collect()
    }
}

fn set_from_env<T: FromStr>(name: &str, target: &mut T) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| EngineError::Config(format!("{name}={raw}: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.manifest_depth, 5);
        assert_eq!(config.partitions().len(), DEFAULT_PARTITION_ORDER.len());
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"batch_size": 10}"#).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.batch_retries, 3);
        assert_eq!(config.record_ceiling_bytes, 400 * 1024);
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let config = EngineConfig::default();
        assert_eq!(config.retry_backoff(0), Duration::from_millis(100));
        assert_eq!(config.retry_backoff(1), Duration::from_millis(200));
        assert_eq!(config.retry_backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let config = EngineConfig {
            rebuild_soft_warn_bytes: 10,
            rebuild_hard_ceiling_bytes: 5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = EngineConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
