//! Auxiliary indexes.
//!
//! The [`IndexManager`] maintains hash, range, full-text, vector, and
//! composite indexes incrementally on every accepted mutation, and answers
//! `select_index` during planning with the single best candidate for a
//! filter. Indexes hold field values and id references only; entity
//! ownership stays with the store.

pub mod key;
pub mod text;
pub mod vector;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ChronicleError, DbResult};
use crate::filter::{Filter, RangeBound, VectorQuery};
use crate::model::{namespace_path_segment, Entity, EntityId, EventOp, EventRecord};

pub use key::IndexKey;
pub use text::{tokenize, InvertedIndex};
pub use vector::VectorIndex;

/// Index variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Exact equality and `$in`
    Hash,
    /// Ordered comparators
    Range,
    /// Tokenized inverted index with `$search`
    FullText,
    /// ANN over fixed-dimension embeddings
    Vector { dims: usize },
    /// Multi-field ordered
    Composite,
}

/// Registered index description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub kind: IndexKind,
    pub fields: Vec<String>,
    pub unique: bool,
}

/// The index chosen for a query, with its cost estimate inputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectedIndex {
    pub name: String,
    pub kind: IndexKind,
    pub fields: Vec<String>,
    pub estimated_rows: u64,
    /// Fraction of the namespace expected to match, in [0, 1].
    pub selectivity: f64,
}

enum IndexStructure {
    Hash(HashMap<IndexKey, BTreeSet<EntityId>>),
    Range(BTreeMap<IndexKey, BTreeSet<EntityId>>),
    Text(InvertedIndex),
    Vector(VectorIndex),
    Composite(BTreeMap<Vec<IndexKey>, BTreeSet<EntityId>>),
}

struct RegisteredIndex {
    def: IndexDefinition,
    structure: IndexStructure,
}

#[derive(Default)]
struct NamespaceIndexes {
    indexes: Vec<RegisteredIndex>,
    entity_count: u64,
}

/// Per-namespace index registry and maintenance.
#[derive(Default)]
pub struct IndexManager {
    namespaces: DashMap<String, Arc<RwLock<NamespaceIndexes>>>,
}

impl IndexManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, namespace: &str) -> Arc<RwLock<NamespaceIndexes>> {
        self.namespaces
            .entry(namespace_path_segment(namespace))
            .or_default()
            .clone()
    }

    /// Register an index. Existing entities are backfilled by the caller via
    /// [`Self::apply_create`].
    ///
    /// # Errors
    ///
    /// Rejects duplicate names, empty field lists, and malformed shapes
    /// (text/vector over anything but one field list entry as declared).
    pub async fn register(&self, namespace: &str, def: IndexDefinition) -> DbResult<()> {
        if def.fields.is_empty() {
            return Err(ChronicleError::validation("index needs at least one field"));
        }
        if matches!(def.kind, IndexKind::Vector { .. }) && def.fields.len() != 1 {
            return Err(ChronicleError::validation("vector index covers exactly one field"));
        }
        let slot = self.slot(namespace);
        let mut ns = slot.write().await;
        if ns.indexes.iter().any(|i| i.def.name == def.name) {
            return Err(ChronicleError::conflict(format!(
                "index '{}' already exists",
                def.name
            )));
        }
        let structure = match def.kind {
            IndexKind::Hash => IndexStructure::Hash(HashMap::new()),
            IndexKind::Range => IndexStructure::Range(BTreeMap::new()),
            IndexKind::FullText => IndexStructure::Text(InvertedIndex::new()),
            IndexKind::Vector { dims } => IndexStructure::Vector(VectorIndex::new(dims)),
            IndexKind::Composite => IndexStructure::Composite(BTreeMap::new()),
        };
        debug!(namespace, index = %def.name, "index registered");
        ns.indexes.push(RegisteredIndex { def, structure });
        Ok(())
    }

    /// Registered definitions for a namespace.
    pub async fn definitions(&self, namespace: &str) -> Vec<IndexDefinition> {
        let slot = self.slot(namespace);
        let ns = slot.read().await;
        ns.indexes.iter().map(|i| i.def.clone()).collect()
    }

    /// Every registered definition with its namespace, for persistence.
    pub async fn all_definitions(&self) -> Vec<(String, IndexDefinition)> {
        let slots: Vec<(String, Arc<RwLock<NamespaceIndexes>>)> = self
            .namespaces
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut out = Vec::new();
        for (namespace, slot) in slots {
            let ns = slot.read().await;
            for index in &ns.indexes {
                out.push((namespace.clone(), index.def.clone()));
            }
        }
        out.sort_by(|a, b| (&a.0, &a.1.name).cmp(&(&b.0, &b.1.name)));
        out
    }

    /// Unique-constraint check, run while staging a mutation (before any
    /// state changes).
    ///
    /// # Errors
    ///
    /// Returns a conflict naming the violated index.
    pub async fn check_unique(&self, namespace: &str, entity: &Entity) -> DbResult<()> {
        let slot = self.slot(namespace);
        let ns = slot.read().await;
        for index in ns.indexes.iter().filter(|i| i.def.unique) {
            let keys = entity_keys(&index.def, entity);
            let occupied = match &index.structure {
                IndexStructure::Hash(map) => keys.iter().any(|k| {
                    map.get(k).is_some_and(|ids| ids.iter().any(|id| id != &entity.id))
                }),
                IndexStructure::Range(map) => keys.iter().any(|k| {
                    map.get(k).is_some_and(|ids| ids.iter().any(|id| id != &entity.id))
                }),
                IndexStructure::Composite(map) => {
                    let key = composite_key(&index.def, entity);
                    map.get(&key).is_some_and(|ids| ids.iter().any(|id| id != &entity.id))
                }
                _ => false,
            };
            if occupied {
                return Err(ChronicleError::conflict(format!(
                    "unique index '{}' violated by {}",
                    index.def.name, entity.id
                )));
            }
        }
        Ok(())
    }

    /// Apply an accepted event's index delta.
    pub async fn apply_event(&self, event: &EventRecord) {
        let namespace = event.namespace().to_string();
        match event.op {
            EventOp::Create => {
                if let Some(after) = &event.after {
                    self.apply_create(&namespace, after).await;
                }
            }
            EventOp::Update => {
                if let (Some(before), Some(after)) = (&event.before, &event.after) {
                    self.apply_update(&namespace, before, after).await;
                }
            }
            EventOp::Delete => {
                if let Some(before) = &event.before {
                    self.apply_delete(&namespace, before).await;
                }
            }
            // Edge deltas are carried by the relationship store's reverse
            // index.
            EventOp::Link | EventOp::Unlink => {}
        }
    }

    pub async fn apply_create(&self, namespace: &str, entity: &Entity) {
        let slot = self.slot(namespace);
        let mut ns = slot.write().await;
        ns.entity_count += 1;
        for index in &mut ns.indexes {
            insert_entity(index, entity);
        }
    }

    pub async fn apply_update(&self, namespace: &str, before: &Entity, after: &Entity) {
        let slot = self.slot(namespace);
        let mut ns = slot.write().await;
        for index in &mut ns.indexes {
            // Remove old keys before inserting new ones, but only when the
            // indexed fields actually changed.
            let changed = index
                .def
                .fields
                .iter()
                .any(|f| before.field(f) != after.field(f));
            if changed {
                remove_entity(index, before);
                insert_entity(index, after);
            }
        }
    }

    pub async fn apply_delete(&self, namespace: &str, entity: &Entity) {
        let slot = self.slot(namespace);
        let mut ns = slot.write().await;
        ns.entity_count = ns.entity_count.saturating_sub(1);
        for index in &mut ns.indexes {
            remove_entity(index, entity);
        }
    }

    /// Tracked live-entity count for a namespace.
    pub async fn entity_count(&self, namespace: &str) -> u64 {
        let slot = self.slot(namespace);
        let count = slot.read().await.entity_count;
        count
    }

    /// Full-text search through the first FTS index of the namespace.
    pub async fn search_text(&self, namespace: &str, query: &str) -> Vec<(EntityId, f64)> {
        let slot = self.slot(namespace);
        let ns = slot.read().await;
        for index in &ns.indexes {
            if let IndexStructure::Text(text) = &index.structure {
                return text.search(query);
            }
        }
        Vec::new()
    }

    /// Vector search through the index covering `field`.
    pub async fn search_vector(
        &self,
        namespace: &str,
        field: &str,
        query: &[f64],
        top_k: usize,
    ) -> Vec<(EntityId, f32)> {
        let slot = self.slot(namespace);
        let ns = slot.read().await;
        for index in &ns.indexes {
            if index.def.fields.first().map(String::as_str) == Some(field) {
                if let IndexStructure::Vector(v) = &index.structure {
                    return v.search(query, top_k);
                }
            }
        }
        Vec::new()
    }

    /// Equality/`$in` lookup through a hash or range index on `field`.
    pub async fn lookup_eq(&self, namespace: &str, field: &str, values: &[Value]) -> Vec<EntityId> {
        let keys: Vec<IndexKey> = values.iter().filter_map(IndexKey::from_value).collect();
        let slot = self.slot(namespace);
        let ns = slot.read().await;
        for index in &ns.indexes {
            if index.def.fields.first().map(String::as_str) != Some(field) {
                continue;
            }
            let mut out: BTreeSet<EntityId> = BTreeSet::new();
            match &index.structure {
                IndexStructure::Hash(map) => {
                    for key in &keys {
                        if let Some(ids) = map.get(key) {
                            out.extend(ids.iter().cloned());
                        }
                    }
                }
                IndexStructure::Range(map) => {
                    for key in &keys {
                        if let Some(ids) = map.get(key) {
                            out.extend(ids.iter().cloned());
                        }
                    }
                }
                _ => continue,
            }
            return out.into_iter().collect();
        }
        Vec::new()
    }

    /// Ordered lookup through a range index on `field`.
    pub async fn lookup_range(
        &self,
        namespace: &str,
        field: &str,
        lower: Option<&RangeBound>,
        upper: Option<&RangeBound>,
    ) -> Vec<EntityId> {
        let slot = self.slot(namespace);
        let ns = slot.read().await;
        for index in &ns.indexes {
            if index.def.fields.first().map(String::as_str) != Some(field) {
                continue;
            }
            if let IndexStructure::Range(map) = &index.structure {
                let low = bound_of(lower);
                let high = bound_of(upper);
                let mut out: BTreeSet<EntityId> = BTreeSet::new();
                for (_, ids) in map.range((low, high)) {
                    out.extend(ids.iter().cloned());
                }
                return out.into_iter().collect();
            }
        }
        Vec::new()
    }

    /// Pick the single best index for a filter, or `None` for a full scan.
    ///
    /// Ties break by fewest estimated rows, then selectivity, then index
    /// name for determinism.
    pub async fn select_index(&self, namespace: &str, filter: &Filter) -> Option<SelectedIndex> {
        let slot = self.slot(namespace);
        let ns = slot.read().await;
        let total = ns.entity_count.max(1);

        // `$text` and `$vector` roots take precedence outright.
        if let Some(search) = text_query(filter) {
            for index in &ns.indexes {
                if let IndexStructure::Text(text) = &index.structure {
                    let estimated = text.estimate(search).min(total);
                    return Some(SelectedIndex {
                        name: index.def.name.clone(),
                        kind: index.def.kind.clone(),
                        fields: index.def.fields.clone(),
                        estimated_rows: estimated,
                        // FTS selectivity floor keeps index plans preferred
                        // for large namespaces.
                        selectivity: (estimated as f64 / total as f64).max(0.1),
                    });
                }
            }
        }
        if let Some(vq) = vector_query(filter) {
            for index in &ns.indexes {
                if index.def.fields.first().map(String::as_str) == Some(vq.field.as_str()) {
                    if let IndexStructure::Vector(_) = &index.structure {
                        let estimated = (vq.top_k as u64).min(total);
                        return Some(SelectedIndex {
                            name: index.def.name.clone(),
                            kind: index.def.kind.clone(),
                            fields: index.def.fields.clone(),
                            estimated_rows: estimated,
                            selectivity: estimated as f64 / total as f64,
                        });
                    }
                }
            }
        }

        let mut best: Option<(u64, usize, SelectedIndex)> = None;
        for index in &ns.indexes {
            let Some((estimated, prefix_len)) = estimate_candidate(index, filter, total) else {
                continue;
            };
            let candidate = SelectedIndex {
                name: index.def.name.clone(),
                kind: index.def.kind.clone(),
                fields: index.def.fields.clone(),
                estimated_rows: estimated,
                selectivity: estimated as f64 / total as f64,
            };
            let better = match &best {
                None => true,
                Some((best_rows, best_prefix, best_sel)) => {
                    (estimated, std::cmp::Reverse(prefix_len), &candidate.name)
                        < (*best_rows, std::cmp::Reverse(*best_prefix), &best_sel.name)
                }
            };
            if better {
                best = Some((estimated, prefix_len, candidate));
            }
        }
        best.map(|(_, _, selected)| selected)
    }

    pub fn clear(&self) {
        self.namespaces.clear();
    }
}

/// Equality-covered prefix length and row estimate for one candidate index.
fn estimate_candidate(index: &RegisteredIndex, filter: &Filter, total: u64) -> Option<(u64, usize)> {
    match &index.structure {
        IndexStructure::Hash(map) => {
            let field = index.def.fields.first()?;
            let values = filter.pinned_set(field)?;
            let estimated: u64 = values
                .iter()
                .filter_map(|v| IndexKey::from_value(v))
                .map(|k| map.get(&k).map_or(0, BTreeSet::len) as u64)
                .sum();
            Some((estimated.min(total), 1))
        }
        IndexStructure::Range(map) => {
            let field = index.def.fields.first()?;
            if let Some(values) = filter.pinned_set(field) {
                let estimated: u64 = values
                    .iter()
                    .filter_map(|v| IndexKey::from_value(v))
                    .map(|k| map.get(&k).map_or(0, BTreeSet::len) as u64)
                    .sum();
                return Some((estimated.min(total), 1));
            }
            let (lower, upper) = filter.range_bounds(field);
            if lower.is_none() && upper.is_none() {
                return None;
            }
            let low = bound_of(lower.as_ref());
            let high = bound_of(upper.as_ref());
            let estimated: u64 = map
                .range((low, high))
                .map(|(_, ids)| ids.len() as u64)
                .sum();
            Some((estimated.min(total), 1))
        }
        IndexStructure::Composite(map) => {
            // Left-to-right prefix of fields fully pinned by equality.
            let mut prefix: Vec<IndexKey> = Vec::new();
            for field in &index.def.fields {
                match filter.pinned_value(field).and_then(IndexKey::from_value) {
                    Some(key) => prefix.push(key),
                    None => break,
                }
            }
            if prefix.is_empty() {
                return None;
            }
            let prefix_len = prefix.len();
            let estimated: u64 = map
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(_, ids)| ids.len() as u64)
                .sum();
            Some((estimated.min(total), prefix_len))
        }
        IndexStructure::Text(_) | IndexStructure::Vector(_) => None,
    }
}

fn bound_of(bound: Option<&RangeBound>) -> Bound<IndexKey> {
    match bound.and_then(|b| IndexKey::from_value(&b.value).map(|k| (k, b.inclusive))) {
        Some((key, true)) => Bound::Included(key),
        Some((key, false)) => Bound::Excluded(key),
        None => Bound::Unbounded,
    }
}

/// The `$text` search string of a filter, if any.
fn text_query(filter: &Filter) -> Option<&str> {
    match filter {
        Filter::Text { search } => Some(search),
        Filter::And(terms) => terms.iter().find_map(text_query),
        _ => None,
    }
}

/// The `$vector` root of a filter, if any.
fn vector_query(filter: &Filter) -> Option<&VectorQuery> {
    match filter {
        Filter::Vector(v) => Some(v),
        Filter::And(terms) => terms.iter().find_map(vector_query),
        _ => None,
    }
}

fn entity_keys(def: &IndexDefinition, entity: &Entity) -> Vec<IndexKey> {
    def.fields
        .first()
        .and_then(|f| entity.field(f))
        .map(|v| IndexKey::expand(&v))
        .unwrap_or_default()
}

fn composite_key(def: &IndexDefinition, entity: &Entity) -> Vec<IndexKey> {
    def.fields
        .iter()
        .map(|f| {
            entity
                .field(f)
                .and_then(|v| IndexKey::from_value(&v))
                .unwrap_or(IndexKey::Null)
        })
        .collect()
}

fn searchable_text(def: &IndexDefinition, entity: &Entity) -> String {
    def.fields
        .iter()
        .filter_map(|f| entity.field(f))
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect::<Vec<_>>()
        .join(" ")
}

fn embedding_of(def: &IndexDefinition, entity: &Entity) -> Option<Vec<f32>> {
    let field = def.fields.first()?;
    let value = entity.field(field)?;
    let numbers = value.as_array()?;
    numbers
        .iter()
        .map(|n| n.as_f64().map(|f| f as f32))
        .collect()
}

fn insert_entity(index: &mut RegisteredIndex, entity: &Entity) {
    match &mut index.structure {
        IndexStructure::Hash(map) => {
            for key in entity_keys(&index.def, entity) {
                map.entry(key).or_default().insert(entity.id.clone());
            }
        }
        IndexStructure::Range(map) => {
            for key in entity_keys(&index.def, entity) {
                map.entry(key).or_default().insert(entity.id.clone());
            }
        }
        IndexStructure::Text(text) => {
            let content = searchable_text(&index.def, entity);
            if content.is_empty() {
                text.remove(&entity.id);
            } else {
                text.insert(entity.id.clone(), &content);
            }
        }
        IndexStructure::Vector(vectors) => {
            match embedding_of(&index.def, entity) {
                // Dimension mismatches were rejected at validation time; a
                // mismatch here means the index was added later, skip the row.
                Some(embedding) => {
                    let _ = vectors.insert(entity.id.clone(), embedding);
                }
                None => vectors.remove(&entity.id),
            }
        }
        IndexStructure::Composite(map) => {
            map.entry(composite_key(&index.def, entity))
                .or_default()
                .insert(entity.id.clone());
        }
    }
}

fn remove_entity(index: &mut RegisteredIndex, entity: &Entity) {
    match &mut index.structure {
        IndexStructure::Hash(map) => {
            for key in entity_keys(&index.def, entity) {
                if let Some(ids) = map.get_mut(&key) {
                    ids.remove(&entity.id);
                    if ids.is_empty() {
                        map.remove(&key);
                    }
                }
            }
        }
        IndexStructure::Range(map) => {
            for key in entity_keys(&index.def, entity) {
                if let Some(ids) = map.get_mut(&key) {
                    ids.remove(&entity.id);
                    if ids.is_empty() {
                        map.remove(&key);
                    }
                }
            }
        }
        IndexStructure::Text(text) => text.remove(&entity.id),
        IndexStructure::Vector(vectors) => vectors.remove(&entity.id),
        IndexStructure::Composite(map) => {
            let key = composite_key(&index.def, entity);
            if let Some(ids) = map.get_mut(&key) {
                ids.remove(&entity.id);
                if ids.is_empty() {
                    map.remove(&key);
                }
            }
        }
    }
}
