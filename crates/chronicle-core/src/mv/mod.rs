//! Materialized views.
//!
//! A view materializes a source namespace through an optional filter,
//! expansion list, projection, and grouping/aggregation. The registry tracks
//! staleness (mutations on the source mark views stale) and the router
//! decides whether a view can serve a query more cheaply than a scan, with a
//! residual post-filter.

mod router;

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ChronicleError, DbResult};
use crate::model::{namespace_path_segment, Entity};
use crate::model::value::{compare_values, lookup_path};

pub use router::{route, MvRouteDecision};

/// View definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MvDefinition {
    pub name: String,
    /// Source namespace.
    pub source: String,
    /// Wire-level filter applied to the source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    /// Edge predicates expanded/flattened into each row.
    #[serde(default)]
    pub expand: Vec<String>,
    /// `$select`: the fields the view materializes (plus core fields).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub select: Option<Vec<String>>,
    /// `$groupBy` fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    /// `$compute`: output field -> `{"$count": 1}` / `{"$sum": "amount"}` /
    /// `$avg` / `$min` / `$max`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute: Option<Map<String, Value>>,
}

impl MvDefinition {
    /// Whether the view materializes aggregates rather than rows.
    #[must_use]
    pub fn is_grouped(&self) -> bool {
        self.group_by.is_some() || self.compute.is_some()
    }
}

/// View staleness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MvStaleness {
    Fresh,
    Stale { usable: bool },
    Invalid,
}

/// A registered view with its materialized rows.
#[derive(Debug, Clone)]
pub struct MaterializedView {
    pub definition: MvDefinition,
    pub staleness: MvStaleness,
    pub row_estimate: u64,
    rows: Vec<Value>,
}

/// View registry, single-writer / multi-reader.
#[derive(Default)]
pub struct MvRegistry {
    views: DashMap<String, Arc<RwLock<MaterializedView>>>,
}

impl MvRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a view definition. The first refresh materializes it.
    ///
    /// # Errors
    ///
    /// Rejects duplicate names and compute entries without `$groupBy`
    /// pairing rules (compute alone is a single-group aggregate and is
    /// allowed).
    pub async fn define(&self, definition: MvDefinition) -> DbResult<()> {
        if self.views.contains_key(&definition.name) {
            return Err(ChronicleError::conflict(format!(
                "view '{}' already exists",
                definition.name
            )));
        }
        debug!(view = %definition.name, source = %definition.source, "view registered");
        self.views.insert(
            definition.name.clone(),
            Arc::new(RwLock::new(MaterializedView {
                definition,
                staleness: MvStaleness::Stale { usable: false },
                row_estimate: 0,
                rows: Vec::new(),
            })),
        );
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.views.remove(name).is_some()
    }

    /// Snapshot of one view's metadata (definition, staleness, estimate).
    pub async fn view(&self, name: &str) -> Option<MaterializedView> {
        let slot = self.views.get(name)?.clone();
        let view = slot.read().await;
        Some(view.clone())
    }

    /// All view snapshots.
    pub async fn list(&self) -> Vec<MaterializedView> {
        let slots: Vec<Arc<RwLock<MaterializedView>>> =
            self.views.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.read().await.clone());
        }
        out.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
        out
    }

    /// Materialized rows of a fresh-enough view.
    ///
    /// # Errors
    ///
    /// Not-found for unknown views.
    pub async fn rows(&self, name: &str) -> DbResult<Vec<Value>> {
        let slot = self
            .views
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| ChronicleError::not_found(format!("view '{name}'")))?;
        let view = slot.read().await;
        Ok(view.rows.clone())
    }

    /// Store refreshed rows and mark the view fresh.
    pub async fn store_refresh(&self, name: &str, rows: Vec<Value>) -> DbResult<()> {
        let slot = self
            .views
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| ChronicleError::not_found(format!("view '{name}'")))?;
        let mut view = slot.write().await;
        view.row_estimate = rows.len() as u64;
        view.rows = rows;
        view.staleness = MvStaleness::Fresh;
        Ok(())
    }

    /// A mutation on `namespace` leaves its views stale-but-usable.
    pub async fn mark_source_stale(&self, namespace: &str) {
        let key = namespace_path_segment(namespace);
        let slots: Vec<Arc<RwLock<MaterializedView>>> =
            self.views.iter().map(|e| e.value().clone()).collect();
        for slot in slots {
            let mut view = slot.write().await;
            if namespace_path_segment(&view.definition.source) == key
                && view.staleness == MvStaleness::Fresh
            {
                view.staleness = MvStaleness::Stale { usable: true };
            }
        }
    }

    /// Mark a view unusable until redefined or refreshed.
    pub async fn invalidate(&self, name: &str) -> DbResult<()> {
        let slot = self
            .views
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| ChronicleError::not_found(format!("view '{name}'")))?;
        slot.write().await.staleness = MvStaleness::Invalid;
        Ok(())
    }

    pub fn clear(&self) {
        self.views.clear();
    }
}

/// Materialize view output rows from source entities: expand is applied by
/// the caller (needs the relationship store); this handles select + group.
#[must_use]
pub fn materialize_rows(definition: &MvDefinition, entities: &[Entity]) -> Vec<Value> {
    if definition.is_grouped() {
        return aggregate_rows(definition, entities);
    }

    entities
        .iter()
        .map(|entity| {
            let doc = entity.to_document();
            match &definition.select {
                None => doc,
                Some(fields) => {
                    let mut out = Map::new();
                    if let Value::Object(source) = &doc {
                        for core in crate::model::CORE_FIELDS {
                            if let Some(v) = source.get(*core) {
                                out.insert((*core).to_string(), v.clone());
                            }
                        }
                        for field in fields {
                            if let Some(v) = lookup_path(&doc, field) {
                                out.insert(field.clone(), v.clone());
                            }
                        }
                    }
                    Value::Object(out)
                }
            }
        })
        .collect()
}

fn aggregate_rows(definition: &MvDefinition, entities: &[Entity]) -> Vec<Value> {
    use std::collections::BTreeMap;

    let group_fields: Vec<String> = definition.group_by.clone().unwrap_or_default();
    let mut groups: BTreeMap<String, (Map<String, Value>, Vec<&Entity>)> = BTreeMap::new();

    for entity in entities {
        let mut key_doc = Map::new();
        for field in &group_fields {
            key_doc.insert(field.clone(), entity.field(field).unwrap_or(Value::Null));
        }
        let key = Value::Object(key_doc.clone()).to_string();
        groups.entry(key).or_insert_with(|| (key_doc, Vec::new())).1.push(entity);
    }

    groups
        .into_values()
        .map(|(mut row, members)| {
            if let Some(compute) = &definition.compute {
                for (output, spec) in compute {
                    row.insert(output.clone(), compute_aggregate(spec, &members));
                }
            }
            row.insert("$count".into(), Value::from(members.len() as u64));
            Value::Object(row)
        })
        .collect()
}

fn compute_aggregate(spec: &Value, members: &[&Entity]) -> Value {
    let Some(obj) = spec.as_object() else { return Value::Null };
    let Some((op, operand)) = obj.iter().next() else { return Value::Null };

    let numbers = |field: &str| -> Vec<f64> {
        members
            .iter()
            .filter_map(|e| e.field(field))
            .filter_map(|v| v.as_f64())
            .collect()
    };

    match (op.as_str(), operand.as_str()) {
        ("$count", _) => Value::from(members.len() as u64),
        ("$sum", Some(field)) => Value::from(numbers(field).iter().sum::<f64>()),
        ("$avg", Some(field)) => {
            let values = numbers(field);
            if values.is_empty() {
                Value::Null
            } else {
                Value::from(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        ("$min", Some(field)) => members
            .iter()
            .filter_map(|e| e.field(field))
            .min_by(|a, b| compare_values(a, b))
            .unwrap_or(Value::Null),
        ("$max", Some(field)) => members
            .iter()
            .filter_map(|e| e.field(field))
            .max_by(|a, b| compare_values(a, b))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityId;
    use chrono::Utc;
    use serde_json::json;

    fn entity(local: &str, data: Value) -> Entity {
        let map = data.as_object().cloned().unwrap_or_default();
        Entity::create(EntityId::new("orders", local), "Order".into(), map, "t", Utc::now())
    }

    fn def(name: &str) -> MvDefinition {
        MvDefinition {
            name: name.into(),
            source: "orders".into(),
            filter: Some(json!({"status": "paid"})),
            expand: vec![],
            select: None,
            group_by: None,
            compute: None,
        }
    }

    #[tokio::test]
    async fn test_registry_lifecycle() {
        let registry = MvRegistry::new();
        registry.define(def("paid_orders")).await.unwrap();
        assert!(registry.define(def("paid_orders")).await.is_err());

        // Newly defined views are stale and unusable until refreshed.
        let view = registry.view("paid_orders").await.unwrap();
        assert_eq!(view.staleness, MvStaleness::Stale { usable: false });

        registry
            .store_refresh("paid_orders", vec![json!({"$id": "orders/o1"})])
            .await
            .unwrap();
        let view = registry.view("paid_orders").await.unwrap();
        assert_eq!(view.staleness, MvStaleness::Fresh);
        assert_eq!(view.row_estimate, 1);

        registry.mark_source_stale("orders").await;
        let view = registry.view("paid_orders").await.unwrap();
        assert_eq!(view.staleness, MvStaleness::Stale { usable: true });

        registry.invalidate("paid_orders").await.unwrap();
        let view = registry.view("paid_orders").await.unwrap();
        assert_eq!(view.staleness, MvStaleness::Invalid);
    }

    #[test]
    fn test_materialize_with_select() {
        let mut definition = def("view");
        definition.select = Some(vec!["status".into()]);
        let rows = materialize_rows(
            &definition,
            &[entity("o1", json!({"status": "paid", "amount": 10}))],
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], json!("paid"));
        assert!(rows[0].get("amount").is_none());
        // Core fields survive projection.
        assert_eq!(rows[0]["$id"], json!("orders/o1"));
    }

    #[test]
    fn test_grouped_aggregates() {
        let mut definition = def("totals");
        definition.group_by = Some(vec!["status".into()]);
        let mut compute = Map::new();
        compute.insert("total".into(), json!({"$sum": "amount"}));
        compute.insert("avg".into(), json!({"$avg": "amount"}));
        definition.compute = Some(compute);

        let rows = materialize_rows(
            &definition,
            &[
                entity("o1", json!({"status": "paid", "amount": 10})),
                entity("o2", json!({"status": "paid", "amount": 30})),
                entity("o3", json!({"status": "open", "amount": 5})),
            ],
        );
        assert_eq!(rows.len(), 2);
        let paid = rows.iter().find(|r| r["status"] == json!("paid")).unwrap();
        assert_eq!(paid["total"], json!(40.0));
        assert_eq!(paid["avg"], json!(20.0));
        assert_eq!(paid["$count"], json!(2));
    }
}
