//! Entity model: identifiers, snapshots, and document projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ChronicleError, DbResult};

/// Stable entity identifier of the form `<namespace>/<local>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Build an id from namespace and local parts.
    #[must_use]
    pub fn new(namespace: &str, local: &str) -> Self {
        Self(format!("{namespace}/{local}"))
    }

    /// Parse and validate an id string.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the id is not `<namespace>/<local>`
    /// with non-empty parts.
    pub fn parse(raw: &str) -> DbResult<Self> {
        match raw.split_once('/') {
            Some((ns, local)) if !ns.is_empty() && !local.is_empty() && !local.contains('/') => {
                Ok(Self(raw.to_string()))
            }
            _ => Err(ChronicleError::validation(format!(
                "entity id must be '<namespace>/<local>', got '{raw}'"
            ))),
        }
    }

    /// The namespace part of the id.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.0.split_once('/').map_or("", |(ns, _)| ns)
    }

    /// The local part of the id.
    #[must_use]
    pub fn local(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(_, local)| local)
    }

    /// The full `<namespace>/<local>` form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authoritative entity snapshot.
///
/// Serializes as the wire-level document: core fields (`$id`, `$type`,
/// `version`, audit timestamps) plus the flattened open payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    #[serde(rename = "$id")]
    pub id: EntityId,
    #[serde(rename = "$type", default)]
    pub entity_type: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default = "epoch")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Field names that are always present in projections.
pub const CORE_FIELDS: &[&str] = &[
    "$id",
    "$type",
    "name",
    "version",
    "createdAt",
    "updatedAt",
];

impl Entity {
    /// Create a version-1 snapshot for a freshly created entity.
    #[must_use]
    pub fn create(id: EntityId, entity_type: String, data: Map<String, Value>, actor: &str, at: DateTime<Utc>) -> Self {
        Self {
            id,
            entity_type,
            version: 1,
            created_at: at,
            created_by: actor.to_string(),
            updated_at: at,
            updated_by: actor.to_string(),
            deleted_at: None,
            deleted_by: None,
            data,
        }
    }

    /// Whether the entity is tombstoned.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Look up a field by path, covering both core fields and the payload.
    #[must_use]
    pub fn field(&self, path: &str) -> Option<Value> {
        match path {
            "$id" => Some(Value::String(self.id.as_str().to_string())),
            "$type" => Some(Value::String(self.entity_type.clone())),
            "version" => Some(Value::from(self.version)),
            "createdAt" => Some(Value::String(self.created_at.to_rfc3339())),
            "createdBy" => Some(Value::String(self.created_by.clone())),
            "updatedAt" => Some(Value::String(self.updated_at.to_rfc3339())),
            "updatedBy" => Some(Value::String(self.updated_by.clone())),
            "deletedAt" => self.deleted_at.map(|t| Value::String(t.to_rfc3339())),
            "deletedBy" => self.deleted_by.clone().map(Value::String),
            _ => {
                let doc = Value::Object(self.data.clone());
                super::value::lookup_path(&doc, path).cloned()
            }
        }
    }

    /// Full wire-level document for this snapshot.
    #[must_use]
    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse a snapshot back from its wire-level document.
    ///
    /// # Errors
    ///
    /// Returns a validation error when core fields are missing or malformed.
    pub fn from_document(doc: &Value) -> DbResult<Self> {
        serde_json::from_value(doc.clone())
            .map_err(|e| ChronicleError::validation(format!("malformed entity document: {e}")))
    }

    /// Approximate in-memory size, used for buffer accounting.
    #[must_use]
    pub fn approximate_size(&self) -> usize {
        let core = self.id.as_str().len()
            + self.entity_type.len()
            + self.created_by.len()
            + self.updated_by.len()
            + 64;
        core + super::value::approximate_size(&Value::Object(self.data.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Entity {
        let mut data = Map::new();
        data.insert("name".into(), json!("Hello"));
        Entity::create(
            EntityId::new("posts", "p1"),
            "Post".into(),
            data,
            "tester",
            Utc::now(),
        )
    }

    #[test]
    fn test_id_parse_and_parts() {
        let id = EntityId::parse("posts/p1").unwrap();
        assert_eq!(id.namespace(), "posts");
        assert_eq!(id.local(), "p1");

        assert!(EntityId::parse("posts").is_err());
        assert!(EntityId::parse("/p1").is_err());
        assert!(EntityId::parse("a/b/c").is_err());
    }

    #[test]
    fn test_document_round_trip() {
        let entity = sample();
        let doc = entity.to_document();
        assert_eq!(doc["$id"], json!("posts/p1"));
        assert_eq!(doc["$type"], json!("Post"));
        assert_eq!(doc["name"], json!("Hello"));
        assert_eq!(doc["version"], json!(1));

        let back = Entity::from_document(&doc).unwrap();
        assert_eq!(back, entity);
    }

    #[test]
    fn test_field_lookup_covers_core_and_payload() {
        let entity = sample();
        assert_eq!(entity.field("$type"), Some(json!("Post")));
        assert_eq!(entity.field("name"), Some(json!("Hello")));
        assert_eq!(entity.field("missing"), None);
        assert_eq!(entity.field("deletedAt"), None);
    }
}
