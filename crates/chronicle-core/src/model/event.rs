//! Immutable event records: the unit of the append-only log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use super::entity::{Entity, EntityId};

/// Next event id: ULIDs made strictly monotonic within the process so the
/// export stream's id order agrees with commit order even inside one
/// millisecond.
#[must_use]
pub fn next_event_id() -> Ulid {
    use std::sync::Mutex;
    static GENERATOR: Mutex<Option<ulid::Generator>> = Mutex::new(None);
    let mut slot = match GENERATOR.lock() {
        Ok(slot) => slot,
        Err(poisoned) => poisoned.into_inner(),
    };
    let generator = slot.get_or_insert_with(ulid::Generator::new);
    generator.generate().unwrap_or_else(|_| Ulid::new())
}

/// Mutation operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventOp {
    Create,
    Update,
    Delete,
    Link,
    Unlink,
}

/// Immutable record of one accepted mutation.
///
/// Within a namespace `seq` is dense and strictly increasing. `before` is
/// present on Update/Delete, `after` on Create/Update; Link/Unlink carry the
/// edge predicate and counterpart id instead of payload snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: Ulid,
    pub ts: DateTime<Utc>,
    pub seq: u64,
    pub op: EventOp,
    pub target: EntityId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Entity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Entity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// Edge predicate, Link/Unlink only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    /// Edge counterpart, Link/Unlink only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterpart: Option<EntityId>,
}

impl EventRecord {
    /// Namespace this event belongs to.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.target.namespace()
    }

    /// Approximate encoded size in bytes, used for buffer accounting.
    #[must_use]
    pub fn approximate_size(&self) -> usize {
        let snapshots = self.before.as_ref().map_or(0, Entity::approximate_size)
            + self.after.as_ref().map_or(0, Entity::approximate_size);
        64 + self.target.as_str().len() + snapshots
    }

    /// Apply this event on top of an optional prior snapshot, producing the
    /// post-event snapshot. Used by replay and point-in-time reconstruction.
    #[must_use]
    pub fn apply(&self, prior: Option<Entity>) -> Option<Entity> {
        match self.op {
            EventOp::Create | EventOp::Update => self.after.clone().or(prior),
            EventOp::Delete => {
                let mut entity = self.before.clone().or(prior)?;
                entity.deleted_at = Some(self.ts);
                entity.deleted_by = self.actor.clone();
                entity.version += 1;
                Some(entity)
            }
            // Edge events do not change the target snapshot payload.
            EventOp::Link | EventOp::Unlink => prior,
        }
    }
}
