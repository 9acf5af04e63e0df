//! Brand Alias Cache
//!
//! Agencies report the same company under many spellings ("ACME Corp.",
//! "Acme Corporation", "acme inc"). Aggregation groups companies by *brand*,
//! obtained in two steps:
//!
//! 1. **Normalize**: lowercase, drop punctuation and corporate suffixes, join
//!    the remaining words with `-` (`"ACME Corp."` → `acme`)
//! 2. **Alias table**: an optional JSON map at `aliases/brands.json` from
//!    normalized name to brand (`{"wal-mart-stores": "walmart"}`)
//!
//! ## Caching
//!
//! Both the table and individual resolutions are cached with a TTL; resolved
//! names sit in an LRU so a partition with many distinct spellings cannot
//! grow the cache without bound. The cache is owned by whoever constructs the
//! engines and injected into them, so tests get a fresh one per case.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use regsync_core::now_ms;
use regsync_observability::metrics;
use regsync_store::{get_typed, JsonStore};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;

pub const ALIAS_TABLE_KEY: &str = "aliases/brands.json";

const CORPORATE_SUFFIXES: &[&str] = &[
    "inc", "incorporated", "llc", "llp", "lp", "ltd", "limited", "corp", "corporation", "co",
    "company", "plc",
];

/// Cache entry with TTL
#[derive(Clone)]
struct CacheEntry<T> {
    value: T,
    expires_at: i64,
}

impl<T> CacheEntry<T> {
    fn new(value: T, ttl_ms: i64) -> Self {
        Self {
            value,
            expires_at: now_ms() + ttl_ms,
        }
    }

    fn is_expired(&self) -> bool {
        now_ms() >= self.expires_at
    }
}

type AliasTable = Arc<BTreeMap<String, String>>;

pub struct AliasCache {
    json: Arc<dyn JsonStore>,
    ttl_ms: i64,
    resolved: RwLock<LruCache<String, CacheEntry<String>>>,
    table: RwLock<Option<CacheEntry<AliasTable>>>,
}

impl AliasCache {
    pub fn new(json: Arc<dyn JsonStore>, capacity: usize, ttl_ms: i64) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            json,
            ttl_ms,
            resolved: RwLock::new(LruCache::new(capacity)),
            table: RwLock::new(None),
        }
    }

    /// Brand for a raw company name.
    pub async fn resolve(&self, raw: &str) -> Result<String> {
        {
            let mut cache = self.resolved.write().await;
            if let Some(entry) = cache.get(raw) {
                if !entry.is_expired() {
                    metrics::ALIAS_CACHE_HITS_TOTAL.inc();
                    return Ok(entry.value.clone());
                }
                cache.pop(raw);
            }
        }

        metrics::ALIAS_CACHE_MISSES_TOTAL.inc();
        let normalized = normalize_brand(raw);
        let table = self.table().await?;
        let brand = table.get(&normalized).cloned().unwrap_or(normalized);

        self.resolved
            .write()
            .await
            .put(raw.to_string(), CacheEntry::new(brand.clone(), self.ttl_ms));
        Ok(brand)
    }

    /// Drop every cached resolution and the alias table.
    pub async fn invalidate(&self) {
        self.resolved.write().await.clear();
        *self.table.write().await = None;
    }

    async fn table(&self) -> Result<AliasTable> {
        if let Some(entry) = self.table.read().await.as_ref() {
            if !entry.is_expired() {
                return Ok(entry.value.clone());
            }
        }

        let loaded: BTreeMap<String, String> = get_typed(self.json.as_ref(), ALIAS_TABLE_KEY)
            .await?
            .unwrap_or_default();
        debug!(aliases = loaded.len(), "loaded brand alias table");
        let table = Arc::new(loaded);
        *self.table.write().await = Some(CacheEntry::new(table.clone(), self.ttl_ms));
        Ok(table)
    }
}

/// Canonical form of a company name; `"unknown"` when nothing is left.
pub fn normalize_brand(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_alphanumeric() {
            cleaned.extend(c.to_lowercase());
        } else {
            cleaned.push(' ');
        }
    }
    let mut words: Vec<&str> = cleaned.split_whitespace().collect();
    if words.first() == Some(&"the") && words.len() > 1 {
        words.remove(0);
    }
    while words.len() > 1 && words.last().is_some_and(|w| CORPORATE_SUFFIXES.contains(w)) {
        words.pop();
    }
    if words.is_empty() {
        "unknown".to_string()
    } else {
        words.join("-")
    }
}
