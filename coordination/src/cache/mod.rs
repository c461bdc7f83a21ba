//! Result cache: content-addressed keys, a pluggable store, and the
//! cache-aside wrapper used by routing, dispatch and search.

pub mod aside;
pub mod key;
pub mod store;

pub use aside::{CacheAside, CacheStats, CacheStatsSnapshot, SharedCacheAside};
pub use key::{escape_segment, CacheKey, KeyScope, SEARCH_SCOPE};
pub use store::{
    CacheEntry, CacheError, CacheResult, CacheStore, MemoryCacheStore, SharedCacheStore,
};
