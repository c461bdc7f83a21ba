//! Cache store abstraction and the in-memory implementation.
//!
//! The store only sees rendered string keys. Whole entries are replaced on
//! `set`, so a reader sees either the old value or the new one, never a mix
//! (last writer wins per key).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Errors raised by cache stores
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheError {
    #[error("Cache store unavailable: {0}")]
    Unavailable(String),

    #[error("Cache value serialization failed: {0}")]
    Serialization(String),

    #[error("Invalid cache key pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

impl CacheError {
    /// Whether the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// One cached value with its metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Rendered store key
    pub key: String,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    /// Organization the entry is scoped to
    pub org_id: String,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        value: serde_json::Value,
        ttl: Duration,
        org_id: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            created_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
            org_id: org_id.into(),
        }
    }
}

/// Key/value store with TTL and pattern deletion.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Entry under `key`, `None` when absent or expired.
    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>>;

    /// Replace the entry under `key`. It expires after `ttl`.
    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> CacheResult<()>;

    /// Remove every key matching the glob `pattern`. Returns the count removed.
    async fn delete_by_pattern(&self, pattern: &str) -> CacheResult<usize>;
}

/// Shared reference to a cache store
pub type SharedCacheStore = Arc<dyn CacheStore>;

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: CacheEntry,
    expires_at: Instant,
}

/// In-process store backed by a sharded concurrent map.
///
/// Expiry is lazy: expired entries are dropped when read, when the store is
/// full, or by an explicit [`purge_expired`](Self::purge_expired).
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: DashMap<String, StoredEntry>,
    /// 0 = unbounded
    max_entries: usize,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding at most `max_entries` (0 = unbounded).
    pub fn with_capacity_limit(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns the count removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Make room for one new key when the bound is reached.
    fn make_room(&self, incoming: &str) {
        if self.max_entries == 0
            || self.entries.len() < self.max_entries
            || self.entries.contains_key(incoming)
        {
            return;
        }
        if self.purge_expired() > 0 && self.entries.len() < self.max_entries {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().expires_at)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            debug!(key = %key, "cache: evicting entry closest to expiry");
            self.entries.remove(&key);
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(stored) if stored.expires_at > now => return Ok(Some(stored.entry.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        // Expired: drop it unless a writer replaced it in the meantime.
        self.entries.remove_if(key, |_, stored| stored.expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> CacheResult<()> {
        self.make_room(key);
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                entry,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete_by_pattern(&self, pattern: &str) -> CacheResult<usize> {
        let matcher = Glob::new(pattern)
            .map_err(|e| CacheError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?
            .compile_matcher();

        let before = self.entries.len();
        self.entries.retain(|key, _| !matcher.is_match(key.as_str()));
        Ok(before.saturating_sub(self.entries.len()))
    }
}
