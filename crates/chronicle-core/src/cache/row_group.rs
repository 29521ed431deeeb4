//! LRU cache of decoded row groups.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::rowgroup::DecodedRowGroup;

/// Row-group cache configuration
#[derive(Debug, Clone)]
pub struct RowGroupCacheConfig {
    /// Byte budget across all entries
    pub max_bytes: usize,
    /// Entry-count budget
    pub max_entries: usize,
    /// Optional age limit for entries
    pub ttl: Option<Duration>,
    /// Initial cache version (bumped when the binary format changes)
    pub initial_version: u32,
}

impl Default for RowGroupCacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
            max_entries: 1_024,
            ttl: None,
            initial_version: crate::rowgroup::codec::FORMAT_VERSION,
        }
    }
}

/// Cache observability counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RowGroupCacheStats {
    pub entries: usize,
    pub size_bytes: usize,
    pub max_size_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    /// 0 when the cache has seen no requests.
    pub hit_rate: f64,
    pub evictions: u64,
}

type CacheKey = (String, usize, u32);

struct CacheEntry {
    group: Arc<DecodedRowGroup>,
    size: usize,
    inserted: Instant,
}

struct CacheInner {
    lru: LruCache<CacheKey, CacheEntry>,
    size_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    version: u32,
}

/// Bounded LRU from `(path, row-group index, cache version)` to decoded row
/// groups. Hits hand back the same `Arc` payload (reference semantics).
pub struct RowGroupCache {
    config: RowGroupCacheConfig,
    inner: Mutex<CacheInner>,
}

impl RowGroupCache {
    #[must_use]
    pub fn new(config: RowGroupCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::new(capacity),
                size_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                version: config.initial_version,
            }),
            config,
        }
    }

    /// Current cache version used for key construction.
    pub async fn version(&self) -> u32 {
        self.inner.lock().await.version
    }

    /// Bump the cache version; entries keyed under older versions can no
    /// longer hit and age out through normal eviction.
    pub async fn bump_version(&self) -> u32 {
        let mut inner = self.inner.lock().await;
        inner.version += 1;
        debug!(version = inner.version, "row-group cache version bumped");
        inner.version
    }

    /// Fetch a decoded row group, refreshing its recency on hit.
    pub async fn get(&self, path: &str, index: usize) -> Option<Arc<DecodedRowGroup>> {
        let mut inner = self.inner.lock().await;
        let key = (path.to_string(), index, inner.version);

        if let Some(entry) = inner.lru.get_mut(&key) {
            let expired = self
                .config
                .ttl
                .is_some_and(|ttl| entry.inserted.elapsed() > ttl);
            if !expired {
                entry.inserted = Instant::now();
                let group = Arc::clone(&entry.group);
                inner.hits += 1;
                return Some(group);
            }
            // TTL eviction on access.
            if let Some(entry) = inner.lru.pop(&key) {
                inner.size_bytes = inner.size_bytes.saturating_sub(entry.size);
                inner.evictions += 1;
            }
        }
        inner.misses += 1;
        None
    }

    /// Insert a decoded row group under the current cache version.
    pub async fn put(&self, path: &str, index: usize, group: Arc<DecodedRowGroup>) {
        let size = group.size_bytes();
        let mut inner = self.inner.lock().await;
        let key = (path.to_string(), index, inner.version);

        if let Some(old) = inner.lru.push(key, CacheEntry { group, size, inserted: Instant::now() }) {
            // push returns the displaced LRU entry (or the replaced value).
            inner.size_bytes = inner.size_bytes.saturating_sub(old.1.size);
            inner.evictions += 1;
        }
        inner.size_bytes += size;

        // Byte-budget eviction, least recently used first.
        while inner.size_bytes > self.config.max_bytes {
            match inner.lru.pop_lru() {
                Some((_, entry)) => {
                    inner.size_bytes = inner.size_bytes.saturating_sub(entry.size);
                    inner.evictions += 1;
                }
                None => break,
            }
        }
    }

    /// Invalidate one row group of one file.
    pub async fn invalidate(&self, path: &str, index: usize) {
        let mut inner = self.inner.lock().await;
        let version = inner.version;
        if let Some(entry) = inner.lru.pop(&(path.to_string(), index, version)) {
            inner.size_bytes = inner.size_bytes.saturating_sub(entry.size);
        }
    }

    /// Invalidate every cached row group of a file.
    pub async fn invalidate_file(&self, path: &str) {
        self.invalidate_matching(|key| key.0 == path).await;
    }

    /// Invalidate everything under a path prefix (namespace invalidation).
    pub async fn invalidate_prefix(&self, prefix: &str) {
        let prefix = prefix.to_string();
        self.invalidate_matching(move |key| key.0.starts_with(&prefix)).await;
    }

    async fn invalidate_matching(&self, pred: impl Fn(&CacheKey) -> bool) {
        let mut inner = self.inner.lock().await;
        let keys: Vec<CacheKey> = inner
            .lru
            .iter()
            .filter(|(k, _)| pred(k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            if let Some(entry) = inner.lru.pop(&key) {
                inner.size_bytes = inner.size_bytes.saturating_sub(entry.size);
            }
        }
    }

    /// Drop every entry and reset the hit/miss/eviction counters.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.lru.clear();
        inner.size_bytes = 0;
        inner.hits = 0;
        inner.misses = 0;
        inner.evictions = 0;
    }

    /// Current stats snapshot.
    pub async fn stats(&self) -> RowGroupCacheStats {
        let inner = self.inner.lock().await;
        let requests = inner.hits + inner.misses;
        RowGroupCacheStats {
            entries: inner.lru.len(),
            size_bytes: inner.size_bytes,
            max_size_bytes: self.config.max_bytes,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if requests == 0 {
                0.0
            } else {
                inner.hits as f64 / requests as f64
            },
            evictions: inner.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entity, EntityId};
    use crate::rowgroup::RowGroup;
    use chrono::Utc;
    use serde_json::{json, Map};

    fn group(local: &str) -> Arc<DecodedRowGroup> {
        let mut data = Map::new();
        data.insert("name".into(), json!(local));
        let entity = Entity::create(
            EntityId::new("posts", local),
            "Post".into(),
            data,
            "t",
            Utc::now(),
        );
        Arc::new(RowGroup::from_entities(format!("g-{local}"), 1, 1, &[entity]))
    }

    fn cache(max_entries: usize) -> RowGroupCache {
        RowGroupCache::new(RowGroupCacheConfig {
            max_bytes: usize::MAX,
            max_entries,
            ttl: None,
            initial_version: 1,
        })
    }

    #[tokio::test]
    async fn test_hit_returns_same_arc() {
        let cache = cache(8);
        let g = group("a");
        cache.put("data/posts/data.parquet", 0, Arc::clone(&g)).await;

        let hit = cache.get("data/posts/data.parquet", 0).await.unwrap();
        assert!(Arc::ptr_eq(&hit, &g));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert!((stats.hit_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_lru_eviction_order() {
        let cache = cache(2);
        cache.put("f", 0, group("a")).await;
        cache.put("f", 1, group("b")).await;
        // Touch A so B becomes least recently used.
        assert!(cache.get("f", 0).await.is_some());
        cache.put("f", 2, group("c")).await;

        assert!(cache.get("f", 0).await.is_some(), "A should survive");
        assert!(cache.get("f", 1).await.is_none(), "B should be evicted");
        assert!(cache.get("f", 2).await.is_some(), "C should survive");
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_version_bump_misses() {
        let cache = cache(8);
        cache.put("f", 0, group("a")).await;
        assert!(cache.get("f", 0).await.is_some());

        cache.bump_version().await;
        assert!(cache.get("f", 0).await.is_none());

        // Re-populated under the new version.
        cache.put("f", 0, group("a")).await;
        assert!(cache.get("f", 0).await.is_some());
    }

    #[tokio::test]
    async fn test_invalidation_scopes() {
        let cache = cache(16);
        cache.put("data/posts/data.parquet", 0, group("a")).await;
        cache.put("data/posts/data.parquet", 1, group("b")).await;
        cache.put("data/users/data.parquet", 0, group("c")).await;

        cache.invalidate("data/posts/data.parquet", 0).await;
        assert!(cache.get("data/posts/data.parquet", 0).await.is_none());
        assert!(cache.get("data/posts/data.parquet", 1).await.is_some());

        cache.invalidate_file("data/posts/data.parquet").await;
        assert!(cache.get("data/posts/data.parquet", 1).await.is_none());

        cache.invalidate_prefix("data/users").await;
        assert!(cache.get("data/users/data.parquet", 0).await.is_none());
    }

    #[tokio::test]
    async fn test_clear_resets_counters() {
        let cache = cache(8);
        cache.put("f", 0, group("a")).await;
        let _ = cache.get("f", 0).await;
        let _ = cache.get("f", 9).await;

        cache.clear().await;
        let stats = cache.stats().await;
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.size_bytes, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert!((stats.hit_rate - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_byte_budget_eviction() {
        let g = group("a");
        let budget = g.size_bytes() + g.size_bytes() / 2;
        let cache = RowGroupCache::new(RowGroupCacheConfig {
            max_bytes: budget,
            max_entries: 100,
            ttl: None,
            initial_version: 1,
        });

        cache.put("f", 0, Arc::clone(&g)).await;
        cache.put("f", 1, group("b")).await;

        let stats = cache.stats().await;
        assert!(stats.size_bytes <= budget);
        assert_eq!(stats.entries, 1);
        assert!(stats.evictions >= 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = RowGroupCache::new(RowGroupCacheConfig {
            max_bytes: usize::MAX,
            max_entries: 8,
            ttl: Some(Duration::from_millis(20)),
            initial_version: 1,
        });
        cache.put("f", 0, group("a")).await;
        assert!(cache.get("f", 0).await.is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("f", 0).await.is_none());
        assert!(cache.stats().await.evictions >= 1);
    }
}
