//! Memoization of point-in-time entity reconstructions.

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::Mutex;

use crate::model::{Entity, EntityId};

/// LRU from `(entity id, sequence)` to the reconstructed snapshot at that
/// sequence. Entries are dropped wholesale when the namespace state changes
/// shape (compaction) or on facade disposal.
pub struct ReconstructionCache {
    inner: Mutex<LruCache<(EntityId, u64), Entity>>,
}

impl ReconstructionCache {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn get(&self, id: &EntityId, seq: u64) -> Option<Entity> {
        self.inner.lock().await.get(&(id.clone(), seq)).cloned()
    }

    pub async fn put(&self, id: EntityId, seq: u64, entity: Entity) {
        self.inner.lock().await.put((id, seq), entity);
    }

    /// Drop every memoized snapshot for one entity.
    pub async fn invalidate_entity(&self, id: &EntityId) {
        let mut inner = self.inner.lock().await;
        let keys: Vec<(EntityId, u64)> = inner
            .iter()
            .filter(|((k, _), _)| k == id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            inner.pop(&key);
        }
    }

    pub async fn clear(&self) {
        self.inner.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}
