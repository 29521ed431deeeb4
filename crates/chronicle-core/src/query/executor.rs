//! Plan execution.
//!
//! Resolves data paths, streams row groups with statistics-based skipping,
//! consults the row-group cache (decoding on miss), evaluates the residual
//! filter, overlays the in-memory event tail, then projects, sorts, and
//! paginates. `$text` / `$vector` strategies pull an ordered id stream from
//! the index instead of scanning.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::cache::RowGroupCache;
use crate::error::DbResult;
use crate::filter::Filter;
use crate::index::IndexManager;
use crate::model::value::{compare_values, lookup_path, set_path};
use crate::model::{Entity, EntityId, CORE_FIELDS};
use crate::query::options::{cursor, Projection, QueryOptions, SortDirection};
use crate::query::plan::{QueryPlan, QueryStrategy};
use crate::router::Router;
use crate::rowgroup::{io, DataFile};
use crate::storage::StorageBackend;
use crate::store::{EntityStore, RelationshipStore};

/// Page of query results.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub items: Vec<Value>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Executes compiled plans against storage and in-memory state.
pub struct QueryExecutor {
    backend: Arc<dyn StorageBackend>,
    router: Arc<Router>,
    cache: Arc<RowGroupCache>,
    indexes: Arc<IndexManager>,
    entities: Arc<EntityStore>,
    relationships: Arc<RelationshipStore>,
}

impl QueryExecutor {
    #[must_use]
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        router: Arc<Router>,
        cache: Arc<RowGroupCache>,
        indexes: Arc<IndexManager>,
        entities: Arc<EntityStore>,
        relationships: Arc<RelationshipStore>,
    ) -> Self {
        Self {
            backend,
            router,
            cache,
            indexes,
            entities,
            relationships,
        }
    }

    /// Execute a plan and return one result page.
    ///
    /// # Errors
    ///
    /// Surfaces storage failures, corrupt row groups, and cancellation.
    #[instrument(level = "debug", skip_all, fields(namespace = %plan.namespace, strategy = ?plan.strategy))]
    pub async fn execute(&self, plan: &QueryPlan, options: &QueryOptions) -> DbResult<QueryResult> {
        options.check_cancelled()?;
        let mut matches = self.collect_matches(plan, options).await?;

        // Ranked id streams keep their order unless the caller sorts.
        let ranked = plan.uses_id_stream();
        if !options.sort.is_empty() {
            sort_entities(&mut matches, &options.sort);
        } else if !ranked {
            matches.sort_by(|a, b| a.id.cmp(&b.id));
        }

        // Pagination: explicit skip, or the offset carried by the cursor.
        let offset = match (&options.cursor, options.skip) {
            (Some(token), _) => cursor::decode(token)?,
            (None, Some(skip)) => skip,
            (None, None) => 0,
        };
        let total = matches.len();
        let page: Vec<Entity> = match options.limit {
            Some(limit) => matches.into_iter().skip(offset).take(limit).collect(),
            None => matches.into_iter().skip(offset).collect(),
        };
        let consumed = offset + page.len();
        let has_more = consumed < total;

        let mut items = Vec::with_capacity(page.len());
        for entity in &page {
            options.check_cancelled()?;
            let mut doc = entity.to_document();
            self.hydrate(&mut doc, entity, options).await?;
            if let Some(projection) = &options.project {
                doc = apply_projection(&doc, projection);
            }
            items.push(doc);
        }

        Ok(QueryResult {
            items,
            has_more,
            cursor: has_more.then(|| cursor::encode(consumed)),
        })
    }

    /// Count matches without materializing a page.
    ///
    /// # Errors
    ///
    /// Surfaces storage failures and cancellation.
    pub async fn count(&self, plan: &QueryPlan, options: &QueryOptions) -> DbResult<usize> {
        options.check_cancelled()?;
        Ok(self.collect_matches(plan, options).await?.len())
    }

    /// All matching entities, ordered by rank for id-stream strategies.
    async fn collect_matches(
        &self,
        plan: &QueryPlan,
        options: &QueryOptions,
    ) -> DbResult<Vec<Entity>> {
        if plan.uses_id_stream() {
            return self.collect_by_id_stream(plan, options).await;
        }

        let mut by_id = self.scan_row_groups(plan, options).await?;
        self.overlay_tail(plan, options, &mut by_id);
        Ok(by_id.into_values().collect())
    }

    /// Ordered ids from the index, hydrated through store/row groups, with
    /// the residual filter re-applied.
    async fn collect_by_id_stream(
        &self,
        plan: &QueryPlan,
        options: &QueryOptions,
    ) -> DbResult<Vec<Entity>> {
        let namespace = &plan.namespace;
        let mut ordered_ids: Vec<EntityId> = Vec::new();

        let text = text_of(&plan.compiled_filter);
        let vector = vector_of(&plan.compiled_filter);
        match (text, vector, plan.strategy) {
            (Some(search), _, QueryStrategy::FtsSearch | QueryStrategy::HybridSearch) => {
                ordered_ids = self
                    .indexes
                    .search_text(namespace, search)
                    .await
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect();
                // Hybrid: vector ranking restricted to the FTS candidates.
                if let (Some(vq), QueryStrategy::HybridSearch) = (vector, plan.strategy) {
                    let candidates: std::collections::HashSet<EntityId> =
                        ordered_ids.iter().cloned().collect();
                    ordered_ids = self
                        .indexes
                        .search_vector(namespace, &vq.field, &vq.query, vq.top_k)
                        .await
                        .into_iter()
                        .map(|(id, _)| id)
                        .filter(|id| candidates.contains(id))
                        .collect();
                }
            }
            (_, Some(vq), _) => {
                ordered_ids = self
                    .indexes
                    .search_vector(namespace, &vq.field, &vq.query, vq.top_k)
                    .await
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect();
            }
            _ => {}
        }

        let mut out = Vec::with_capacity(ordered_ids.len());
        for id in ordered_ids {
            options.check_cancelled()?;
            let Some(entity) = self.fetch_entity(namespace, &id).await? else { continue };
            if entity.is_deleted() && !options.include_deleted {
                continue;
            }
            if plan.compiled_filter.matches(&entity) {
                out.push(entity);
            }
        }
        Ok(out)
    }

    /// Scan published row groups, skipping by statistics for every pushed
    /// predicate, and keep the highest-versioned row per entity.
    async fn scan_row_groups(
        &self,
        plan: &QueryPlan,
        options: &QueryOptions,
    ) -> DbResult<BTreeMap<EntityId, Entity>> {
        let mut by_id: BTreeMap<EntityId, Entity> = BTreeMap::new();
        let paths = self
            .router
            .resolve_data_paths(&plan.namespace, Some(&plan.compiled_filter))
            .await;

        for path in paths {
            options.check_cancelled()?;
            let Some(file) = io::load_file(&self.backend, &path).await? else { continue };
            for (index, meta) in file.metas().iter().enumerate() {
                let skippable = plan
                    .pushed
                    .iter()
                    .any(|(column, predicate)| meta.skippable(column, predicate));
                if skippable {
                    debug!(path, index, "row group skipped by statistics");
                    continue;
                }
                let group = self.load_group(&path, index, &file).await?;
                for entity in group.entities()? {
                    if !plan.compiled_filter.matches(&entity) {
                        continue;
                    }
                    match by_id.get(&entity.id) {
                        Some(existing) if existing.version >= entity.version => {}
                        _ => {
                            by_id.insert(entity.id.clone(), entity);
                        }
                    }
                }
            }
        }
        Ok(by_id)
    }

    /// Overlay the authoritative in-memory state: entities with later events
    /// than the flushed row replace it (and are re-filtered), tombstones drop
    /// out.
    fn overlay_tail(
        &self,
        plan: &QueryPlan,
        options: &QueryOptions,
        by_id: &mut BTreeMap<EntityId, Entity>,
    ) {
        let namespace = crate::model::namespace_path_segment(&plan.namespace);
        for entity in self.entities.all_in_namespace(&namespace) {
            by_id.remove(&entity.id);
            let visible = !entity.is_deleted() || options.include_deleted;
            if visible && plan.compiled_filter.matches(&entity) {
                by_id.insert(entity.id.clone(), entity);
            }
        }
        if !options.include_deleted {
            by_id.retain(|_, e| !e.is_deleted());
        }
    }

    /// Cache-assisted row-group decode.
    async fn load_group(
        &self,
        path: &str,
        index: usize,
        file: &DataFile,
    ) -> DbResult<Arc<crate::rowgroup::RowGroup>> {
        if let Some(cached) = self.cache.get(path, index).await {
            return Ok(cached);
        }
        let group = Arc::new(file.decode_group(index)?);
        self.cache.put(path, index, Arc::clone(&group)).await;
        Ok(group)
    }

    /// Point lookup: the in-memory slot, else the newest flushed row.
    ///
    /// # Errors
    ///
    /// Surfaces storage failures.
    pub async fn fetch_entity(&self, namespace: &str, id: &EntityId) -> DbResult<Option<Entity>> {
        if let Some(entity) = self.entities.get(id) {
            return Ok(Some(entity));
        }
        let namespace = &crate::model::namespace_path_segment(namespace);

        let id_filter = Filter::Field {
            path: "$id".to_string(),
            predicate: crate::filter::FieldPredicate::Eq(Value::String(id.as_str().to_string())),
        };
        let paths = self.router.resolve_data_paths(namespace, Some(&id_filter)).await;
        let mut newest: Option<Entity> = None;
        for path in paths {
            let Some(file) = io::load_file(&self.backend, &path).await? else { continue };
            for (index, meta) in file.metas().iter().enumerate() {
                if meta.skippable("$id", &crate::filter::FieldPredicate::Eq(Value::String(id.as_str().to_string()))) {
                    continue;
                }
                let group = self.load_group(&path, index, &file).await?;
                for entity in group.entities()? {
                    if &entity.id == id
                        && newest.as_ref().is_none_or(|n| entity.version > n.version)
                    {
                        newest = Some(entity);
                    }
                }
            }
        }
        Ok(newest)
    }

    /// Expand requested edge predicates inline on a result document.
    async fn hydrate(
        &self,
        doc: &mut Value,
        entity: &Entity,
        options: &QueryOptions,
    ) -> DbResult<()> {
        if options.hydrate.is_empty() {
            return Ok(());
        }
        let Some(map) = doc.as_object_mut() else { return Ok(()) };
        for predicate in &options.hydrate {
            let edges = self.relationships.edges_of(
                &entity.id,
                crate::model::EdgeDirection::Outgoing,
                Some(predicate),
            );
            let mut expanded = Vec::with_capacity(edges.len());
            for edge in edges {
                let counterpart = self
                    .fetch_entity(edge.to.namespace(), &edge.to)
                    .await?
                    .filter(|e| !e.is_deleted());
                if let Some(counterpart) = counterpart {
                    expanded.push(counterpart.to_document());
                }
            }
            map.insert(predicate.clone(), Value::Array(expanded));
        }
        Ok(())
    }
}

fn text_of(filter: &Filter) -> Option<&str> {
    match filter {
        Filter::Text { search } => Some(search),
        Filter::And(terms) => terms.iter().find_map(text_of),
        _ => None,
    }
}

fn vector_of(filter: &Filter) -> Option<&crate::filter::VectorQuery> {
    match filter {
        Filter::Vector(v) => Some(v),
        Filter::And(terms) => terms.iter().find_map(vector_of),
        _ => None,
    }
}

fn sort_entities(entities: &mut [Entity], sort: &[(String, SortDirection)]) {
    entities.sort_by(|a, b| {
        for (field, direction) in sort {
            let av = a.field(field).unwrap_or(Value::Null);
            let bv = b.field(field).unwrap_or(Value::Null);
            let ord = compare_values(&av, &bv);
            let ord = match direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        a.id.cmp(&b.id)
    });
}

/// Apply a projection; core fields are always present.
#[must_use]
pub fn apply_projection(doc: &Value, projection: &Projection) -> Value {
    let Some(source) = doc.as_object() else { return doc.clone() };
    match projection {
        Projection::Include(fields) => {
            let mut out = Map::new();
            for core in CORE_FIELDS {
                if let Some(v) = source.get(*core) {
                    out.insert((*core).to_string(), v.clone());
                }
            }
            for field in fields {
                if let Some(v) = lookup_path(doc, field) {
                    set_path(&mut out, field, v.clone());
                }
            }
            Value::Object(out)
        }
        Projection::Exclude(fields) => {
            let mut out = source.clone();
            for field in fields {
                if CORE_FIELDS.contains(&field.as_str()) {
                    continue;
                }
                crate::model::value::remove_path(&mut out, field);
            }
            Value::Object(out)
        }
    }
}
