//! Directed edge store with a reverse index.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Map;

use crate::error::{ChronicleError, DbResult};
use crate::frame;
use crate::meta::EDGES_PATH;
use crate::model::{EdgeDirection, EntityId, Relationship, RelationshipKey};
use crate::storage::{StorageBackend, StorageError};

const EDGES_MAGIC: [u8; 4] = *b"CHED";

/// Relationship store: forward edges plus a reverse index of back-edges
/// keyed by target. Lifecycle mirrors entities: Link creates, Unlink
/// tombstones, re-Link revives with an advanced version.
#[derive(Default)]
pub struct RelationshipStore {
    edges: DashMap<RelationshipKey, Relationship>,
    reverse: DashMap<EntityId, HashSet<RelationshipKey>>,
}

impl RelationshipStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live edge lookup.
    #[must_use]
    pub fn get(&self, key: &RelationshipKey) -> Option<Relationship> {
        self.edges.get(key).map(|e| e.clone()).filter(|e| !e.is_deleted())
    }

    /// Create (or revive) an edge. Returns the stored relationship.
    pub fn link(
        &self,
        from: EntityId,
        predicate: String,
        to: EntityId,
        payload: Option<Map<String, serde_json::Value>>,
        actor: &str,
    ) -> Relationship {
        let key = RelationshipKey {
            from: from.clone(),
            predicate: predicate.clone(),
            to: to.clone(),
        };
        let version = self.edges.get(&key).map_or(1, |e| e.version + 1);
        let edge = Relationship {
            from,
            predicate,
            to: to.clone(),
            version,
            payload,
            created_at: Utc::now(),
            created_by: actor.to_string(),
            deleted_at: None,
            deleted_by: None,
        };
        self.edges.insert(key.clone(), edge.clone());
        self.reverse.entry(to).or_default().insert(key);
        edge
    }

    /// Tombstone an edge. Returns the tombstoned relationship when it was
    /// live.
    pub fn unlink(&self, key: &RelationshipKey, actor: &str) -> Option<Relationship> {
        let mut entry = self.edges.get_mut(key)?;
        if entry.is_deleted() {
            return None;
        }
        entry.deleted_at = Some(Utc::now());
        entry.deleted_by = Some(actor.to_string());
        entry.version += 1;
        Some(entry.clone())
    }

    /// Live edges around an entity.
    #[must_use]
    pub fn edges_of(
        &self,
        id: &EntityId,
        direction: EdgeDirection,
        predicate: Option<&str>,
    ) -> Vec<Relationship> {
        let mut out = Vec::new();
        if matches!(direction, EdgeDirection::Outgoing | EdgeDirection::Both) {
            for entry in &self.edges {
                let edge = entry.value();
                if &edge.from == id
                    && !edge.is_deleted()
                    && predicate.is_none_or(|p| p == edge.predicate)
                {
                    out.push(edge.clone());
                }
            }
        }
        if matches!(direction, EdgeDirection::Incoming | EdgeDirection::Both) {
            if let Some(keys) = self.reverse.get(id) {
                for key in keys.iter() {
                    if let Some(edge) = self.get(key) {
                        if predicate.is_none_or(|p| p == edge.predicate) {
                            out.push(edge);
                        }
                    }
                }
            }
        }
        out.sort_by(|a, b| {
            (a.from.as_str(), a.predicate.as_str(), a.to.as_str()).cmp(&(
                b.from.as_str(),
                b.predicate.as_str(),
                b.to.as_str(),
            ))
        });
        out.dedup_by(|a, b| a.key() == b.key());
        out
    }

    /// Epoch snapshot of one edge slot.
    #[must_use]
    pub fn snapshot(&self, key: &RelationshipKey) -> Option<Relationship> {
        self.edges.get(key).map(|e| e.clone())
    }

    /// Epoch rollback of one edge slot.
    pub fn restore(&self, key: &RelationshipKey, snapshot: Option<Relationship>) {
        match snapshot {
            Some(edge) => {
                self.edges.insert(key.clone(), edge);
            }
            None => {
                self.edges.remove(key);
                if let Some(mut keys) = self.reverse.get_mut(&key.to) {
                    keys.remove(key);
                }
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn clear(&self) {
        self.edges.clear();
        self.reverse.clear();
    }

    /// Persist the full edge set to `_edges.parquet` (atomic replace).
    ///
    /// # Errors
    ///
    /// Fails when encoding or the write fails.
    pub async fn persist(&self, backend: &Arc<dyn StorageBackend>) -> DbResult<()> {
        let edges: Vec<Relationship> = self.edges.iter().map(|e| e.value().clone()).collect();
        let body = serde_json::to_vec(&edges)
            .map_err(|e| ChronicleError::internal(format!("edge encode failed: {e}")))?;
        backend
            .write_atomic(EDGES_PATH, &frame::encode(EDGES_MAGIC, &body))
            .await?;
        Ok(())
    }

    /// Load the edge set persisted by [`Self::persist`].
    ///
    /// # Errors
    ///
    /// Fails on storage errors other than not-found, or corrupt contents.
    pub async fn load(&self, backend: &Arc<dyn StorageBackend>) -> DbResult<usize> {
        let bytes = match backend.read(EDGES_PATH).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound { .. }) => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let body = frame::decode(EDGES_MAGIC, &bytes)?;
        let edges: Vec<Relationship> = serde_json::from_slice(&body)
            .map_err(|e| ChronicleError::internal(format!("edge decode failed: {e}")))?;
        let count = edges.len();
        for edge in edges {
            let key = edge.key();
            self.reverse.entry(edge.to.clone()).or_default().insert(key.clone());
            self.edges.insert(key, edge);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn id(ns: &str, local: &str) -> EntityId {
        EntityId::new(ns, local)
    }

    #[test]
    fn test_link_unlink_lifecycle() {
        let store = RelationshipStore::new();
        let edge = store.link(id("posts", "p1"), "author".into(), id("users", "u1"), None, "t");
        assert_eq!(edge.version, 1);

        let key = edge.key();
        assert!(store.get(&key).is_some());

        let tombstone = store.unlink(&key, "t").unwrap();
        assert_eq!(tombstone.version, 2);
        assert!(store.get(&key).is_none());
        assert!(store.unlink(&key, "t").is_none());

        // Re-linking revives with an advanced version.
        let revived = store.link(id("posts", "p1"), "author".into(), id("users", "u1"), None, "t");
        assert_eq!(revived.version, 3);
        assert!(store.get(&key).is_some());
    }

    #[test]
    fn test_reverse_index_serves_incoming() {
        let store = RelationshipStore::new();
        store.link(id("posts", "p1"), "author".into(), id("users", "u1"), None, "t");
        store.link(id("posts", "p2"), "author".into(), id("users", "u1"), None, "t");
        store.link(id("posts", "p1"), "tagged".into(), id("tags", "t1"), None, "t");

        let incoming = store.edges_of(&id("users", "u1"), EdgeDirection::Incoming, None);
        assert_eq!(incoming.len(), 2);

        let filtered = store.edges_of(&id("posts", "p1"), EdgeDirection::Outgoing, Some("tagged"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].to, id("tags", "t1"));

        let both = store.edges_of(&id("posts", "p1"), EdgeDirection::Both, None);
        assert_eq!(both.len(), 2);
    }

    #[tokio::test]
    async fn test_persist_load_round_trip() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let store = RelationshipStore::new();
        store.link(id("posts", "p1"), "author".into(), id("users", "u1"), None, "t");
        store.persist(&backend).await.unwrap();

        let restored = RelationshipStore::new();
        assert_eq!(restored.load(&backend).await.unwrap(), 1);
        let incoming = restored.edges_of(&id("users", "u1"), EdgeDirection::Incoming, None);
        assert_eq!(incoming.len(), 1);
    }
}
