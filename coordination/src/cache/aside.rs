//! Cache-aside wrapper
//!
//! Callers check the cache before computing and write the computed value
//! back on a miss. Store failures never fail the caller: a failed read is
//! a miss, a failed write is skipped, and both are logged and counted.

use super::key::CacheKey;
use super::store::{CacheEntry, CacheResult, SharedCacheStore};
use crate::config::CacheTtlConfig;
use crate::task::TaskType;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cache outcome counters
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    degraded: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
    invalidated: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Reads that failed and were served as misses
    pub degraded: u64,
    pub writes: u64,
    pub write_failures: u64,
    /// Entries removed by invalidation
    pub invalidated: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
        }
    }
}

/// Explicit cache-aside component shared by the router, the dispatcher
/// and the search path.
pub struct CacheAside {
    store: SharedCacheStore,
    config: CacheTtlConfig,
    stats: CacheStats,
    bypass: AtomicBool,
}

/// Shared reference to CacheAside
pub type SharedCacheAside = Arc<CacheAside>;

impl CacheAside {
    pub fn new(store: SharedCacheStore, config: CacheTtlConfig) -> Self {
        Self {
            store,
            config,
            stats: CacheStats::default(),
            bypass: AtomicBool::new(false),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn ttl_for(&self, task_type: TaskType) -> Duration {
        self.config.ttl_for(task_type)
    }

    /// Disable reads and writes. Invalidation still runs.
    pub fn set_bypass(&self, bypass: bool) {
        self.bypass.store(bypass, Ordering::Relaxed);
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass.load(Ordering::Relaxed)
    }

    /// Cached entry for `key`, or `None` on miss, bypass or store failure.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        if self.is_bypassed() {
            return None;
        }
        let rendered = key.render();
        match self.store.get(&rendered).await {
            Ok(Some(entry)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %rendered, "cache: hit");
                Some(entry)
            }
            Ok(None) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %rendered, "cache: miss");
                None
            }
            Err(e) => {
                self.stats.degraded.fetch_add(1, Ordering::Relaxed);
                warn!(key = %rendered, error = %e, "cache: read failed, treating as miss");
                None
            }
        }
    }

    /// Write `value` under `key` with the TTL for `task_type`.
    ///
    /// Returns whether the value was written.
    pub async fn store(&self, key: &CacheKey, task_type: TaskType, value: serde_json::Value) -> bool {
        if self.is_bypassed() {
            return false;
        }
        let rendered = key.render();
        let ttl = self.ttl_for(task_type);
        let entry = CacheEntry::new(rendered.clone(), value, ttl, key.org_id());
        match self.store.set(&rendered, entry, ttl).await {
            Ok(()) => {
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
                debug!(key = %rendered, ttl_secs = ttl.as_secs(), "cache: stored");
                true
            }
            Err(e) => {
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %rendered, error = %e, "cache: write failed, result not cached");
                false
            }
        }
    }

    /// Remove cached results for an org, or for one of its documents.
    ///
    /// A document mutation also changes search results, so removing a
    /// document's entries clears the org's search merges too.
    pub async fn invalidate(&self, org_id: &str, doc_id: Option<&str>) -> CacheResult<usize> {
        let Some(doc_id) = doc_id else {
            return self.invalidate_all(org_id).await;
        };
        let ns = self.namespace();
        let docs = self
            .store
            .delete_by_pattern(&CacheKey::doc_pattern(ns, org_id, doc_id))
            .await?;
        let searches = self
            .store
            .delete_by_pattern(&CacheKey::search_pattern(ns, org_id))
            .await?;
        let removed = docs + searches;
        self.stats
            .invalidated
            .fetch_add(removed as u64, Ordering::Relaxed);
        info!(org = org_id, doc = doc_id, removed, "cache: invalidated document");
        Ok(removed)
    }

    /// Remove every cached result of an org.
    pub async fn invalidate_all(&self, org_id: &str) -> CacheResult<usize> {
        let removed = self
            .store
            .delete_by_pattern(&CacheKey::org_pattern(self.namespace(), org_id))
            .await?;
        self.stats
            .invalidated
            .fetch_add(removed as u64, Ordering::Relaxed);
        info!(org = org_id, removed, "cache: invalidated organization");
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}
