//! Authoritative in-memory state.
//!
//! [`EntityStore`] holds the current snapshot per entity (version, tombstone,
//! payload); [`RelationshipStore`] holds directed edges with a reverse index.
//! Both are single-writer per namespace (updates happen under the namespace
//! write mutex) and multi-reader.

pub mod relationships;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::model::{Entity, EntityId, EventOp, EventRecord};

pub use relationships::RelationshipStore;

/// One tracked entity.
#[derive(Debug, Clone)]
pub struct EntitySlot {
    pub entity: Entity,
    /// When a point-in-time reconstruction last touched this slot.
    pub last_reconstructed: Option<DateTime<Utc>>,
}

/// In-memory snapshot store keyed by entity id.
#[derive(Default)]
pub struct EntityStore {
    slots: DashMap<EntityId, EntitySlot>,
}

impl EntityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot, tombstoned or not.
    #[must_use]
    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        self.slots.get(id).map(|s| s.entity.clone())
    }

    /// Current snapshot, excluding tombstones.
    #[must_use]
    pub fn get_live(&self, id: &EntityId) -> Option<Entity> {
        self.get(id).filter(|e| !e.is_deleted())
    }

    /// Whether a live (non-tombstoned) entity exists.
    #[must_use]
    pub fn exists_live(&self, id: &EntityId) -> bool {
        self.get_live(id).is_some()
    }

    pub fn put(&self, entity: Entity) {
        self.slots.insert(
            entity.id.clone(),
            EntitySlot {
                entity,
                last_reconstructed: None,
            },
        );
    }

    /// Note that a reconstruction touched this slot.
    pub fn touch_reconstructed(&self, id: &EntityId) {
        if let Some(mut slot) = self.slots.get_mut(id) {
            slot.last_reconstructed = Some(Utc::now());
        }
    }

    /// Apply one event to the store (commit and replay paths).
    pub fn apply_event(&self, event: &EventRecord) {
        match event.op {
            EventOp::Create | EventOp::Update | EventOp::Delete => {
                let prior = self.get(&event.target);
                if let Some(next) = event.apply(prior) {
                    self.put(next);
                }
            }
            // Edge events do not change entity snapshots.
            EventOp::Link | EventOp::Unlink => {}
        }
    }

    /// Epoch snapshot of a slot (None when the entity is untracked).
    #[must_use]
    pub fn slot_snapshot(&self, id: &EntityId) -> Option<EntitySlot> {
        self.slots.get(id).map(|s| s.clone())
    }

    /// Epoch rollback: restore a slot to its snapshot (or remove it).
    pub fn restore_slot(&self, id: &EntityId, snapshot: Option<EntitySlot>) {
        match snapshot {
            Some(slot) => {
                self.slots.insert(id.clone(), slot);
            }
            None => {
                self.slots.remove(id);
            }
        }
    }

    /// Live entities of one namespace.
    #[must_use]
    pub fn live_in_namespace(&self, namespace: &str) -> Vec<Entity> {
        self.slots
            .iter()
            .filter(|e| e.key().namespace() == namespace && !e.value().entity.is_deleted())
            .map(|e| e.value().entity.clone())
            .collect()
    }

    /// Every tracked entity of one namespace, tombstones included.
    #[must_use]
    pub fn all_in_namespace(&self, namespace: &str) -> Vec<Entity> {
        self.slots
            .iter()
            .filter(|e| e.key().namespace() == namespace)
            .map(|e| e.value().entity.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&self) {
        self.slots.clear();
    }
}
