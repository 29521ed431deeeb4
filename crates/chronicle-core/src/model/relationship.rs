//! Directed relationships between entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::entity::EntityId;

/// Directed edge from one entity to another, carrying a predicate string and
/// an optional payload. Created by Link, tombstoned by Unlink, versioned like
/// an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub from: EntityId,
    pub predicate: String,
    pub to: EntityId,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
}

impl Relationship {
    /// Edge key: the (from, predicate, to) triple identifying the edge.
    #[must_use]
    pub fn key(&self) -> RelationshipKey {
        RelationshipKey {
            from: self.from.clone(),
            predicate: self.predicate.clone(),
            to: self.to.clone(),
        }
    }

    /// Whether the edge is tombstoned.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Identifying triple for a relationship.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationshipKey {
    pub from: EntityId,
    pub predicate: String,
    pub to: EntityId,
}

/// Direction selector for relationship queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EdgeDirection {
    /// Edges where the entity is the source.
    #[default]
    Outgoing,
    /// Edges where the entity is the target (served by the reverse index).
    Incoming,
    /// Both directions.
    Both,
}
