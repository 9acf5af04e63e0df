//! Lock Manager - Advisory Mutual Exclusion
//!
//! Serializes passes over the same partition across independent invocations.
//! Locks are JSON documents with a holder token and a TTL:
//!
//! 1. **Acquire**: create the lock if absent; if present and expired, replace
//!    it with a version-checked write; if present and live, report contention
//! 2. **Release**: delete the lock if we still hold it
//! 3. **Reclaim**: a crashed holder's lock becomes reclaimable after its TTL
//!
//! Every acquisition gets a fresh holder token, so two passes in the same
//! process never share a lock. The lock is advisory: correctness rests on
//! idempotent writes, the lock only suppresses duplicate work.

use std::sync::Arc;
use std::time::Duration;

use regsync_core::{now_ms, Lock};
use tracing::{debug, info, warn};

use crate::{path_safe, JsonStore, Result};

/// A lock this process currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub key: String,
    pub lock: Lock,
}

/// Result of trying to take a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired(HeldLock),
    Contended { holder: String, expires_at: i64 },
}

pub struct LockManager {
    worker_id: String,
    json: Arc<dyn JsonStore>,
}

impl LockManager {
    pub fn new(worker_id: impl Into<String>, json: Arc<dyn JsonStore>) -> Self {
        Self {
            worker_id: worker_id.into(),
            json,
        }
    }

    fn key(job_class: &str) -> String {
        format!("locks/{}.json", path_safe(job_class))
    }

    /// Try to take the lock for `job_class` (e.g. `rebuild/TX`).
    pub async fn acquire(&self, job_class: &str, ttl: Duration) -> Result<LockAttempt> {
        let key = Self::key(job_class);
        let now = now_ms();
        let lock = Lock {
            holder: format!("{}/{}", self.worker_id, uuid::Uuid::new_v4()),
            acquired_at: now,
            ttl_ms: ttl.as_millis() as i64,
        };
        let value = serde_json::to_value(&lock)?;

        let acquired = match self.json.get_json(&key).await? {
            None => self.json.put_json_if_absent(&key, &value).await?,
            Some(existing) => {
                let current: Lock = serde_json::from_value(existing.value)?;
                if !current.is_expired(now) {
                    debug!(
                        job_class = %job_class,
                        holder = %current.holder,
                        expires_at = current.expires_at(),
                        "Lock held by another pass"
                    );
                    return Ok(LockAttempt::Contended {
                        holder: current.holder.clone(),
                        expires_at: current.expires_at(),
                    });
                }
                warn!(
                    job_class = %job_class,
                    stale_holder = %current.holder,
                    expired_at = current.expires_at(),
                    "Reclaiming expired lock"
                );
                self.json
                    .put_json_if_version(&key, &value, existing.version.as_deref())
                    .await?
            }
        };

        if !acquired {
            // Lost the race to another pass between read and write.
            let holder = match self.json.get_json(&key).await? {
                Some(v) => serde_json::from_value::<Lock>(v.value)?,
                None => lock.clone(),
            };
            return Ok(LockAttempt::Contended {
                expires_at: holder.expires_at(),
                holder: holder.holder,
            });
        }

        info!(
            job_class = %job_class,
            holder = %lock.holder,
            ttl_ms = lock.ttl_ms,
            "Acquired lock"
        );
        Ok(LockAttempt::Acquired(HeldLock { key, lock }))
    }

    /// Release a lock if it is still ours. Releasing a lock that was
    /// reclaimed by someone else is a no-op.
    pub async fn release(&self, held: &HeldLock) -> Result<()> {
        match self.json.get_json(&held.key).await? {
            Some(existing) => {
                let current: Lock = serde_json::from_value(existing.value)?;
                if current.holder == held.lock.holder {
                    self.json.delete(&held.key).await?;
                    info!(key = %held.key, holder = %held.lock.holder, "Released lock");
                } else {
                    warn!(
                        key = %held.key,
                        holder = %held.lock.holder,
                        current_holder = %current.holder,
                        "Lock was reclaimed by another pass, not releasing"
                    );
                }
            }
            None => debug!(key = %held.key, "Lock already gone"),
        }
        Ok(())
    }

    /// Current lock document for a job class, if any.
    pub async fn inspect(&self, job_class: &str) -> Result<Option<Lock>> {
        crate::get_typed(self.json.as_ref(), &Self::key(job_class)).await
    }
}
