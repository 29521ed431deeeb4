//! The database facade.
//!
//! Owns component lifecycle and orchestrates the write path (validation,
//! sequencing, WAL, in-memory commit, flush) and the read path (MV routing,
//! planning, execution). Per-namespace operations are serialized by the
//! namespace write mutex; reads never take it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::Stream;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use ulid::Ulid;

use crate::cache::RowGroupCache;
use crate::config::DatabaseConfig;
use crate::error::{ChronicleError, DbResult};
use crate::event::{recovery, EventLog, FlushOutcome, FlushStatus, Flusher};
use crate::filter::Filter;
use crate::index::{IndexDefinition, IndexManager};
use crate::ingest::{IngestHooks, IngestReport, Transform};
use crate::meta::{MetaStore, NamespaceIndexDef, SchemaFile};
use crate::metrics::MetricsSnapshot;
use crate::model::value::{compare_values, lookup_path};
use crate::model::{
    namespace_path_segment, EdgeDirection, Entity, EntityId, EventOp, EventRecord, Relationship,
};
use crate::mv::{self, MvDefinition, MvRegistry, MvRouteDecision};
use crate::query::executor::apply_projection;
use crate::query::{
    optimizer, stats, QueryExecutor, QueryOptions, QueryPlan, QueryResult, QueryStrategy,
    SortDirection, WriteOptions,
};
use crate::router::{NamespaceSpec, Router};
use crate::rowgroup::io;
use crate::storage::{
    BreakerMetrics, CircuitBreaker, RetryingBackend, StorageBackend,
};
use crate::store::RelationshipStore;

use super::collection::Collection;
use super::context::{self, DbContext};

/// One staged mutation. A single commit may carry many, spanning
/// namespaces; it is applied all-or-nothing.
#[derive(Debug, Clone)]
pub enum Mutation {
    Create {
        namespace: String,
        id: Option<String>,
        entity_type: String,
        data: Map<String, Value>,
    },
    Update {
        id: EntityId,
        update: Map<String, Value>,
    },
    Delete {
        id: EntityId,
    },
    Link {
        from: EntityId,
        predicate: String,
        to: EntityId,
        payload: Option<Map<String, Value>>,
    },
    Unlink {
        from: EntityId,
        predicate: String,
        to: EntityId,
    },
}

struct DbInner {
    config: DatabaseConfig,
    backend: Arc<dyn StorageBackend>,
    breaker: Option<Arc<CircuitBreaker>>,
    context: Arc<DbContext>,
    router: Arc<Router>,
    cache: Arc<RowGroupCache>,
    indexes: Arc<IndexManager>,
    log: Arc<EventLog>,
    meta: Arc<MetaStore>,
    flusher: Arc<Flusher>,
    executor: QueryExecutor,
    views: Arc<MvRegistry>,
    cancel: CancellationToken,
    disposed: AtomicBool,
    flusher_task: Mutex<Option<JoinHandle<()>>>,
}

/// Embeddable event-sourced document database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Open a database over a storage backend: decorate the backend with
    /// retry + circuit breaking, run crash recovery, replay the unflushed
    /// tail, and start the background flusher.
    ///
    /// # Errors
    ///
    /// Surfaces storage failures during recovery.
    #[instrument(level = "debug", skip_all)]
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        config: DatabaseConfig,
    ) -> DbResult<Self> {
        info!(backend = backend.name(), "opening database");

        let retried: Arc<dyn StorageBackend> =
            Arc::new(RetryingBackend::new(backend, config.retry.clone()));
        let (backend, breaker): (Arc<dyn StorageBackend>, Option<Arc<CircuitBreaker>>) =
            match &config.circuit_breaker {
                Some(breaker_config) => {
                    let breaker =
                        Arc::new(CircuitBreaker::new(retried, breaker_config.clone()));
                    (Arc::clone(&breaker) as Arc<dyn StorageBackend>, Some(breaker))
                }
                None => (retried, None),
            };

        let db_context = context::acquire(&backend, &config);
        let router = Arc::new(Router::new(config.router.clone()));
        let cache = Arc::new(RowGroupCache::new(config.row_group_cache.clone()));
        let indexes = Arc::new(IndexManager::new());
        let log = Arc::new(EventLog::new(Arc::clone(&backend), config.flush.clone()));
        let meta = Arc::new(MetaStore::new(Arc::clone(&backend)));
        let flusher = Arc::new(Flusher::new(
            Arc::clone(&backend),
            Arc::clone(&log),
            Arc::clone(&router),
            Arc::clone(&cache),
            Arc::clone(&meta),
        ));

        // Registered schema (namespace specs + index definitions).
        let schema = meta.load_schema().await?;
        for spec in &schema.namespaces {
            router.register(spec.clone()).await;
        }

        // Crash recovery: promote/discard pending groups, seed sequence
        // counters, and re-read the unflushed tail.
        let (report, tails) =
            recovery::recover(&backend, &log, &flusher, &meta, &router).await?;
        for tail in tails.values() {
            for event in tail {
                db_context.entities.apply_event(event);
                apply_edge_event(&db_context.relationships, event);
            }
        }
        info!(
            promoted = report.promoted_pending,
            discarded = report.discarded_pending,
            namespaces = report.namespaces.len(),
            "recovery replayed"
        );

        db_context.relationships.load(&backend).await?;

        let executor = QueryExecutor::new(
            Arc::clone(&backend),
            Arc::clone(&router),
            Arc::clone(&cache),
            Arc::clone(&indexes),
            Arc::clone(&db_context.entities),
            Arc::clone(&db_context.relationships),
        );

        let inner = Arc::new(DbInner {
            config,
            backend,
            breaker,
            context: db_context,
            router,
            cache,
            indexes,
            log,
            meta,
            flusher,
            executor,
            views: Arc::new(MvRegistry::new()),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            flusher_task: Mutex::new(None),
        });
        let db = Self { inner };

        // Index definitions need a backfill pass over current state.
        for entry in &schema.indexes {
            db.inner
                .indexes
                .register(&entry.namespace, entry.definition.clone())
                .await?;
        }
        db.backfill_indexes().await?;

        let task = tokio::spawn(
            Arc::clone(&db.inner.flusher).run_background(db.inner.cancel.clone()),
        );
        *db.inner.flusher_task.lock().await = Some(task);

        info!("✅ database open");
        Ok(db)
    }

    /// Convenience: open over a fresh in-memory backend.
    ///
    /// # Errors
    ///
    /// Surfaces recovery failures (none for an empty backend).
    pub async fn open_in_memory() -> DbResult<Self> {
        Self::open(
            Arc::new(crate::storage::MemoryBackend::new()),
            DatabaseConfig::default(),
        )
        .await
    }

    /// Per-namespace handle with the same surface as the top-level API.
    #[must_use]
    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self.clone(), name)
    }

    /// The storage identity this facade's shared state is keyed by.
    #[must_use]
    pub fn identity(&self) -> uuid::Uuid {
        self.inner.context.identity
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(ChronicleError::internal("database is disposed"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Create an entity. `data` may carry `$type` and `$id` (full or local
    /// form); remaining fields become the open payload.
    ///
    /// # Errors
    ///
    /// `CONFLICT` when a live entity already holds the id; validation errors
    /// on malformed input.
    pub async fn create(&self, namespace: &str, data: Value, opts: &WriteOptions) -> DbResult<Value> {
        let mut docs = self.create_many(namespace, vec![data], opts).await?;
        docs.pop()
            .ok_or_else(|| ChronicleError::internal("create produced no document"))
    }

    /// Create a batch of entities in one atomic commit.
    ///
    /// # Errors
    ///
    /// As [`Self::create`]; the whole batch fails together.
    pub async fn create_many(
        &self,
        namespace: &str,
        items: Vec<Value>,
        opts: &WriteOptions,
    ) -> DbResult<Vec<Value>> {
        let mutations = items
            .into_iter()
            .map(|item| parse_create(namespace, item))
            .collect::<DbResult<Vec<Mutation>>>()?;
        let events = self.commit(mutations, opts).await?;
        Ok(events
            .iter()
            .filter_map(|e| e.after.as_ref().map(Entity::to_document))
            .collect())
    }

    /// Apply `$set` / `$unset` (or a plain merge map) to an entity.
    ///
    /// # Errors
    ///
    /// `ENTITY_NOT_FOUND` for missing or tombstoned targets.
    pub async fn update(
        &self,
        namespace: &str,
        id: &str,
        update: Value,
        opts: &WriteOptions,
    ) -> DbResult<Value> {
        let id = entity_id_in(namespace, id)?;
        let update = update
            .as_object()
            .cloned()
            .ok_or_else(|| ChronicleError::validation("update must be an object"))?;
        let events = self.commit(vec![Mutation::Update { id, update }], opts).await?;
        events
            .first()
            .and_then(|e| e.after.as_ref())
            .map(Entity::to_document)
            .ok_or_else(|| ChronicleError::internal("update produced no document"))
    }

    /// Tombstone an entity.
    ///
    /// # Errors
    ///
    /// `ENTITY_NOT_FOUND` for missing or already tombstoned targets.
    pub async fn delete(&self, namespace: &str, id: &str, opts: &WriteOptions) -> DbResult<()> {
        let id = entity_id_in(namespace, id)?;
        self.commit(vec![Mutation::Delete { id }], opts).await?;
        Ok(())
    }

    /// Create a directed relationship.
    ///
    /// # Errors
    ///
    /// `ENTITY_NOT_FOUND` when either endpoint is missing.
    pub async fn link(
        &self,
        from: &str,
        predicate: &str,
        to: &str,
        payload: Option<Map<String, Value>>,
        opts: &WriteOptions,
    ) -> DbResult<Relationship> {
        let from = EntityId::parse(from)?;
        let to = EntityId::parse(to)?;
        self.commit(
            vec![Mutation::Link {
                from: from.clone(),
                predicate: predicate.to_string(),
                to: to.clone(),
                payload,
            }],
            opts,
        )
        .await?;
        self.inner
            .context
            .relationships
            .get(&crate::model::RelationshipKey {
                from,
                predicate: predicate.to_string(),
                to,
            })
            .ok_or_else(|| ChronicleError::internal("link produced no edge"))
    }

    /// Tombstone a relationship.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` when the edge does not exist or is already tombstoned.
    pub async fn unlink(
        &self,
        from: &str,
        predicate: &str,
        to: &str,
        opts: &WriteOptions,
    ) -> DbResult<()> {
        let from = EntityId::parse(from)?;
        let to = EntityId::parse(to)?;
        self.commit(
            vec![Mutation::Unlink {
                from,
                predicate: predicate.to_string(),
                to,
            }],
            opts,
        )
        .await?;
        Ok(())
    }

    /// Live relationships around an entity.
    ///
    /// # Errors
    ///
    /// Validation errors on malformed ids.
    pub async fn get_relationships(
        &self,
        id: &str,
        direction: EdgeDirection,
        predicate: Option<&str>,
    ) -> DbResult<Vec<Relationship>> {
        self.ensure_open()?;
        let id = EntityId::parse(id)?;
        Ok(self.inner.context.relationships.edges_of(&id, direction, predicate))
    }

    /// The write epoch: validate and stage, make durable in the WAL, then
    /// commit in memory. On a WAL failure every allocated sequence counter
    /// is restored and inserted WAL rows are removed.
    #[instrument(level = "debug", skip_all, fields(mutations = mutations.len()))]
    pub async fn commit(
        &self,
        mutations: Vec<Mutation>,
        opts: &WriteOptions,
    ) -> DbResult<Vec<EventRecord>> {
        self.ensure_open()?;
        opts.check_cancelled()?;
        if mutations.is_empty() {
            return Ok(Vec::new());
        }
        let actor = opts.actor_or_default();

        // Namespaces this commit writes events into, in sorted order so
        // multi-namespace commits cannot deadlock each other.
        let namespaces: BTreeSet<String> = mutations.iter().map(event_namespace).collect();

        // Backpressure before admission: wait for flush headroom.
        for namespace in &namespaces {
            self.inner.log.wait_for_headroom(namespace).await;
        }

        let handles: Vec<Arc<crate::event::NamespaceHandle>> = namespaces
            .iter()
            .map(|ns| self.inner.log.handle(ns))
            .collect();
        let mut guards = Vec::with_capacity(handles.len());
        for handle in &handles {
            guards.push(handle.write_lock.lock().await);
        }

        // Last cancellation point: once sequence numbers are consumed the
        // write runs to completion.
        opts.check_cancelled()?;

        // Epoch snapshot of the sequence counters.
        let mut seq_snapshot: HashMap<String, u64> = HashMap::new();
        for namespace in &namespaces {
            seq_snapshot.insert(namespace.clone(), self.inner.log.last_seq(namespace).await);
        }

        // Stage: validate everything and build events (without sequences).
        let mut staged = self.stage(mutations, &actor, opts).await?;

        // Allocate dense sequence ranges per namespace, in event order.
        for namespace in &namespaces {
            let count = staged.iter().filter(|e| e.namespace() == namespace.as_str()).count() as u64;
            let (first, _) = self.inner.log.allocate_seqs(namespace, count).await;
            let mut next = first;
            for event in staged.iter_mut().filter(|e| e.namespace() == namespace.as_str()) {
                event.seq = next;
                next += 1;
            }
        }

        // Durability: one WAL entry per namespace. A failure rolls back the
        // entries already inserted and restores every counter.
        let mut written = Vec::new();
        for namespace in &namespaces {
            let batch: Vec<EventRecord> = staged
                .iter()
                .filter(|e| e.namespace() == namespace.as_str())
                .cloned()
                .collect();
            match self.inner.log.wal().append(namespace, &batch).await {
                Ok(entry) => written.push(entry),
                Err(err) => {
                    for entry in &written {
                        if let Err(cleanup) = self.inner.log.wal().remove(entry).await {
                            warn!("epoch rollback: WAL cleanup failed: {cleanup}");
                        }
                    }
                    for (namespace, last_seq) in &seq_snapshot {
                        self.inner.log.restore_seq(namespace, *last_seq).await;
                    }
                    self.inner.context.metrics.record_rollback().await;
                    return Err(err);
                }
            }
        }

        // In-memory commit: cannot fail.
        let mut edge_touched = false;
        for event in &staged {
            self.inner.context.entities.apply_event(event);
            self.inner.indexes.apply_event(event).await;
            edge_touched |= apply_edge_event(&self.inner.context.relationships, event);
        }
        for namespace in &namespaces {
            let batch: Vec<EventRecord> = staged
                .iter()
                .filter(|e| e.namespace() == namespace.as_str())
                .cloned()
                .collect();
            self.inner.log.append_committed(namespace, &batch).await;
            self.inner.views.mark_source_stale(namespace).await;
        }
        if edge_touched {
            // Edges have no WAL of their own beyond the events; persist the
            // full set so restarts without tail replay still see them.
            if let Err(err) = self.inner.context.relationships.persist(&self.inner.backend).await {
                warn!("edge persistence failed (will retry next commit): {err}");
            }
        }
        if let Err(err) = self.inner.context.exporter.publish(&staged).await {
            warn!("event export archive append failed: {err}");
        }
        self.inner.context.metrics.record_mutation(staged.len() as u64).await;

        drop(guards);
        Ok(staged)
    }

    /// Validate mutations and build their events. Nothing is mutated here;
    /// any error aborts the epoch with no visible effects.
    async fn stage(
        &self,
        mutations: Vec<Mutation>,
        actor: &str,
        opts: &WriteOptions,
    ) -> DbResult<Vec<EventRecord>> {
        let now = chrono::Utc::now();
        let mut events: Vec<EventRecord> = Vec::with_capacity(mutations.len());
        // Working view so a batch observes its own earlier mutations.
        let mut working: HashMap<EntityId, Option<Entity>> = HashMap::new();

        for mutation in mutations {
            match mutation {
                Mutation::Create { namespace, id, entity_type, data } => {
                    let local = id.unwrap_or_else(|| Ulid::new().to_string().to_lowercase());
                    let id = entity_id_in(&namespace, &local)?;
                    let current = self.resolve(&mut working, &id).await?;
                    if current.as_ref().is_some_and(|e| !e.is_deleted()) {
                        return Err(ChronicleError::conflict(format!(
                            "entity {id} already exists"
                        )));
                    }
                    let mut entity = Entity::create(id.clone(), entity_type, data, actor, now);
                    // Recreation after a delete keeps versions monotonic.
                    if let Some(prior) = &current {
                        entity.version = prior.version + 1;
                    }
                    self.inner.indexes.check_unique(id.namespace(), &entity).await?;
                    working.insert(id.clone(), Some(entity.clone()));
                    events.push(build_event(EventOp::Create, id, None, Some(entity), actor, opts));
                }
                Mutation::Update { id, update } => {
                    let current = self
                        .resolve(&mut working, &id)
                        .await?
                        .filter(|e| !e.is_deleted())
                        .ok_or_else(|| ChronicleError::entity_not_found(id.to_string()))?;
                    let after = apply_update(&current, &update, actor, now)?;
                    self.inner.indexes.check_unique(id.namespace(), &after).await?;
                    working.insert(id.clone(), Some(after.clone()));
                    events.push(build_event(
                        EventOp::Update,
                        id,
                        Some(current),
                        Some(after),
                        actor,
                        opts,
                    ));
                }
                Mutation::Delete { id } => {
                    let current = self
                        .resolve(&mut working, &id)
                        .await?
                        .filter(|e| !e.is_deleted())
                        .ok_or_else(|| ChronicleError::entity_not_found(id.to_string()))?;
                    let mut tombstone = current.clone();
                    tombstone.version += 1;
                    tombstone.deleted_at = Some(now);
                    tombstone.deleted_by = Some(actor.to_string());
                    working.insert(id.clone(), Some(tombstone));
                    events.push(build_event(EventOp::Delete, id, Some(current), None, actor, opts));
                }
                Mutation::Link { from, predicate, to, payload } => {
                    for endpoint in [&from, &to] {
                        if self
                            .resolve(&mut working, endpoint)
                            .await?
                            .filter(|e| !e.is_deleted())
                            .is_none()
                        {
                            return Err(ChronicleError::entity_not_found(endpoint.to_string()));
                        }
                    }
                    let mut event =
                        build_event(EventOp::Link, from, None, None, actor, opts);
                    event.predicate = Some(predicate);
                    event.counterpart = Some(to);
                    event.metadata = merge_metadata(event.metadata.take(), payload);
                    events.push(event);
                }
                Mutation::Unlink { from, predicate, to } => {
                    let key = crate::model::RelationshipKey {
                        from: from.clone(),
                        predicate: predicate.clone(),
                        to: to.clone(),
                    };
                    if self.inner.context.relationships.get(&key).is_none() {
                        return Err(ChronicleError::not_found(format!(
                            "relationship {from} -[{predicate}]-> {to}"
                        )));
                    }
                    let mut event = build_event(EventOp::Unlink, from, None, None, actor, opts);
                    event.predicate = Some(predicate);
                    event.counterpart = Some(to);
                    events.push(event);
                }
            }
        }
        Ok(events)
    }

    /// Current state of an entity as seen by this epoch: the working view,
    /// then the store, then the newest flushed row.
    async fn resolve(
        &self,
        working: &mut HashMap<EntityId, Option<Entity>>,
        id: &EntityId,
    ) -> DbResult<Option<Entity>> {
        if let Some(state) = working.get(id) {
            return Ok(state.clone());
        }
        let current = self.inner.executor.fetch_entity(id.namespace(), id).await?;
        working.insert(id.clone(), current.clone());
        Ok(current)
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Query a namespace.
    ///
    /// # Errors
    ///
    /// Validation errors for malformed filters/options, `CANCELLED` on
    /// cancellation, storage errors from scans.
    #[instrument(level = "debug", skip_all, fields(namespace = %namespace))]
    pub async fn find(
        &self,
        namespace: &str,
        filter: Value,
        opts: &QueryOptions,
    ) -> DbResult<QueryResult> {
        self.ensure_open()?;
        opts.check_cancelled()?;

        let compiled = Filter::parse(&filter)?.normalize();
        self.inner.context.query_stats.record(namespace, &compiled);

        // Materialized-view routing first: a compatible view serves the
        // query more cheaply than any scan.
        let views = self.inner.views.list().await;
        let decision = mv::route(namespace, &compiled, opts, &views);
        if decision.can_use_mv {
            let result = self.serve_from_view(&decision, opts).await?;
            self.inner
                .context
                .metrics
                .record_query(QueryStrategy::MvLookup, result.items.len() as u64)
                .await;
            return Ok(result);
        }

        let plan = self.plan(namespace, &filter, opts).await?;
        let result = self.inner.executor.execute(&plan, opts).await;
        match &result {
            Ok(page) => {
                self.inner
                    .context
                    .metrics
                    .record_query(plan.strategy, page.items.len() as u64)
                    .await;
            }
            Err(err) if err.kind() == crate::error::ErrorKind::Cancelled => {
                self.inner.context.metrics.record_cancelled().await;
            }
            Err(_) => {}
        }
        result
    }

    /// Compile the plan for a query without executing it, plus the MV
    /// routing decision.
    ///
    /// # Errors
    ///
    /// Validation errors for malformed filters.
    pub async fn explain(
        &self,
        namespace: &str,
        filter: Value,
        opts: &QueryOptions,
    ) -> DbResult<(QueryPlan, MvRouteDecision)> {
        self.ensure_open()?;
        let compiled = Filter::parse(&filter)?.normalize();
        let views = self.inner.views.list().await;
        let decision = mv::route(namespace, &compiled, opts, &views);
        let mut plan = self.plan(namespace, &filter, opts).await?;
        if decision.can_use_mv {
            plan.strategy = QueryStrategy::MvLookup;
        }
        Ok((plan, decision))
    }

    async fn plan(
        &self,
        namespace: &str,
        filter: &Value,
        opts: &QueryOptions,
    ) -> DbResult<QueryPlan> {
        let compiled = Filter::parse(filter)?.normalize();
        let mut table_stats = stats::collect(
            &self.inner.backend,
            &self.inner.router,
            namespace,
            Some(&compiled),
        )
        .await?;
        table_stats.tail_rows = self.inner.log.flush_status(namespace).await.unflushed_count as u64;
        table_stats.frequent_point_fields = self
            .inner
            .context
            .query_stats
            .frequent_fields(namespace, self.inner.config.hot_field_threshold);
        let selected = self.inner.indexes.select_index(namespace, &compiled).await;
        optimizer::optimize(namespace, filter, opts, &table_stats, selected)
    }

    async fn serve_from_view(
        &self,
        decision: &MvRouteDecision,
        opts: &QueryOptions,
    ) -> DbResult<QueryResult> {
        let name = decision
            .mv_name
            .as_deref()
            .ok_or_else(|| ChronicleError::internal("view decision without a name"))?;
        let rows = self.inner.views.rows(name).await?;

        let post_filter = match &decision.post_filter {
            Some(raw) => Filter::parse(raw)?.normalize(),
            None => Filter::True,
        };

        let mut matched: Vec<Value> = Vec::with_capacity(rows.len());
        for row in rows {
            opts.check_cancelled()?;
            match Entity::from_document(&row) {
                Ok(entity) => {
                    if !entity.is_deleted() && post_filter.matches(&entity) {
                        matched.push(row);
                    }
                }
                Err(_) => matched.push(row),
            }
        }

        if opts.sort.is_empty() {
            matched.sort_by(|a, b| {
                compare_values(
                    lookup_path(a, "$id").unwrap_or(&Value::Null),
                    lookup_path(b, "$id").unwrap_or(&Value::Null),
                )
            });
        } else {
            matched.sort_by(|a, b| {
                for (field, direction) in &opts.sort {
                    let av = lookup_path(a, field).cloned().unwrap_or(Value::Null);
                    let bv = lookup_path(b, field).cloned().unwrap_or(Value::Null);
                    let ord = compare_values(&av, &bv);
                    let ord = match direction {
                        SortDirection::Asc => ord,
                        SortDirection::Desc => ord.reverse(),
                    };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        let offset = match (&opts.cursor, opts.skip) {
            (Some(token), _) => crate::query::options::cursor::decode(token)?,
            (None, Some(skip)) => skip,
            (None, None) => 0,
        };
        let total = matched.len();
        let mut page: Vec<Value> = match opts.limit {
            Some(limit) => matched.into_iter().skip(offset).take(limit).collect(),
            None => matched.into_iter().skip(offset).collect(),
        };
        if let Some(projection) = &opts.project {
            page = page.iter().map(|doc| apply_projection(doc, projection)).collect();
        }
        let consumed = offset + page.len();
        let has_more = consumed < total;
        Ok(QueryResult {
            items: page,
            has_more,
            cursor: has_more.then(|| crate::query::options::cursor::encode(consumed)),
        })
    }

    /// Fetch one entity. With `at_seq`, reconstructs the snapshot as of that
    /// sequence number.
    ///
    /// # Errors
    ///
    /// `ENTITY_NOT_FOUND` for missing (or tombstoned, unless
    /// `include_deleted`) entities.
    pub async fn get(&self, namespace: &str, id: &str, opts: &QueryOptions) -> DbResult<Value> {
        self.ensure_open()?;
        let id = entity_id_in(namespace, id)?;

        if let Some(seq) = opts.at_seq {
            return self.reconstruct_at(namespace, &id, seq).await;
        }

        // Route through find for exact behavioral parity (hydrate,
        // projection, tombstone handling).
        let filter = serde_json::json!({ "$id": id.as_str() });
        let mut single = opts.clone();
        single.limit = Some(1);
        single.skip = None;
        single.cursor = None;
        let mut result = self.find(namespace, filter, &single).await?;
        result
            .items
            .pop()
            .ok_or_else(|| ChronicleError::entity_not_found(id.to_string()))
    }

    /// Point-in-time reconstruction with memoization.
    async fn reconstruct_at(&self, namespace: &str, id: &EntityId, seq: u64) -> DbResult<Value> {
        if let Some(hit) = self.inner.context.reconstruction.get(id, seq).await {
            return Ok(hit.to_document());
        }

        // Base row: the newest flushed state wholly covered by `seq`.
        let mut base: Option<Entity> = None;
        let paths = self.inner.router.resolve_data_paths(namespace, None).await;
        for path in paths {
            let Some(file) = io::load_file(&self.inner.backend, &path).await? else { continue };
            for (index, meta) in file.metas().iter().enumerate() {
                if meta.last_seq > seq {
                    continue;
                }
                let group = match self.inner.cache.get(&path, index).await {
                    Some(group) => group,
                    None => {
                        let group = Arc::new(file.decode_group(index)?);
                        self.inner.cache.put(&path, index, Arc::clone(&group)).await;
                        group
                    }
                };
                for entity in group.entities()? {
                    if &entity.id == id && base.as_ref().is_none_or(|b| entity.version > b.version) {
                        base = Some(entity);
                    }
                }
            }
        }

        // Replay the buffered tail up to `seq`; events carry full snapshots
        // so replay over the base is idempotent.
        let tail = self.inner.log.tail_for_entity(namespace, id, seq).await;
        let mut state = base;
        for event in &tail {
            state = event.apply(state);
        }

        let entity = state.ok_or_else(|| {
            ChronicleError::entity_not_found(format!("{id} at seq {seq}"))
        })?;
        self.inner
            .context
            .reconstruction
            .put(id.clone(), seq, entity.clone())
            .await;
        self.inner.context.entities.touch_reconstructed(id);
        Ok(entity.to_document())
    }

    /// Count matching entities.
    ///
    /// # Errors
    ///
    /// As [`Self::find`].
    pub async fn count(&self, namespace: &str, filter: Value, opts: &QueryOptions) -> DbResult<usize> {
        self.ensure_open()?;
        let plan = self.plan(namespace, &filter, opts).await?;
        self.inner.executor.count(&plan, opts).await
    }

    /// Whether a live entity holds this id.
    ///
    /// # Errors
    ///
    /// Storage failures during the point lookup.
    pub async fn exists(&self, namespace: &str, id: &str) -> DbResult<bool> {
        self.ensure_open()?;
        let id = entity_id_in(namespace, id)?;
        Ok(self
            .inner
            .executor
            .fetch_entity(namespace, &id)
            .await?
            .is_some_and(|e| !e.is_deleted()))
    }

    // ------------------------------------------------------------------
    // Streaming ingestion
    // ------------------------------------------------------------------

    /// Ingest an asynchronous stream of records in batches through the
    /// normal mutation path. With `ordered = true`, a partial batch is
    /// flushed before an item error surfaces.
    ///
    /// # Errors
    ///
    /// The first item or write error; the error names the committed count.
    pub async fn ingest_stream<S>(
        &self,
        namespace: &str,
        records: S,
        transform: Option<Transform>,
        hooks: IngestHooks,
        opts: &WriteOptions,
    ) -> DbResult<IngestReport>
    where
        S: Stream<Item = DbResult<Value>> + Unpin,
    {
        self.ensure_open()?;
        let config = self.inner.config.ingest.clone();
        crate::ingest::run(records, &config, transform.as_ref(), &hooks, |batch| {
            let db = self.clone();
            let namespace = namespace.to_string();
            let opts = opts.clone();
            async move {
                let docs = db.create_many(&namespace, batch, &opts).await?;
                Ok(docs.len())
            }
        })
        .await
    }

    // ------------------------------------------------------------------
    // Flush & durability
    // ------------------------------------------------------------------

    /// Force-flush one namespace (or all).
    ///
    /// # Errors
    ///
    /// Surfaces the first flush failure; state stays retryable.
    pub async fn flush(&self, namespace: Option<&str>) -> DbResult<Vec<FlushOutcome>> {
        self.ensure_open()?;
        let outcomes = self.inner.flusher.flush_all(namespace).await;
        self.inner
            .context
            .metrics
            .record_flush(outcomes.is_ok())
            .await;
        outcomes
    }

    /// Flush lag for one namespace (or all).
    pub async fn get_flush_status(&self, namespace: Option<&str>) -> Vec<FlushStatus> {
        match namespace {
            Some(ns) => vec![self.inner.log.flush_status(ns).await],
            None => self.inner.log.flush_status_all().await,
        }
    }

    /// Rewrite a namespace's data files, merging row groups and dropping
    /// tombstoned rows. Returns the number of files rewritten.
    ///
    /// # Errors
    ///
    /// Surfaces storage failures; each file is replaced atomically.
    pub async fn compact(&self, namespace: &str) -> DbResult<usize> {
        self.ensure_open()?;
        // Compaction competes with flushes, not with readers.
        let handle = self.inner.log.handle(namespace);
        let _guard = handle.flush_lock.lock().await;

        let mut rewritten = 0;
        for path in self.inner.router.resolve_data_paths(namespace, None).await {
            let Some(file) = io::load_file(&self.inner.backend, &path).await? else { continue };
            if file.group_count() <= 1 {
                continue;
            }
            let mut newest: BTreeMap<EntityId, Entity> = BTreeMap::new();
            let mut first_seq = u64::MAX;
            let mut last_seq = 0;
            for (index, meta) in file.metas().iter().enumerate() {
                first_seq = first_seq.min(meta.first_seq);
                last_seq = last_seq.max(meta.last_seq);
                for entity in file.decode_group(index)?.entities()? {
                    match newest.get(&entity.id) {
                        Some(existing) if existing.version >= entity.version => {}
                        _ => {
                            newest.insert(entity.id.clone(), entity);
                        }
                    }
                }
            }
            let live: Vec<Entity> = newest.into_values().filter(|e| !e.is_deleted()).collect();
            let group = crate::rowgroup::RowGroup::from_entities(
                Ulid::new().to_string(),
                if first_seq == u64::MAX { 0 } else { first_seq },
                last_seq,
                &live,
            );
            let compacted = crate::rowgroup::DataFile::from_groups(vec![group])?;
            io::save_file(&self.inner.backend, &path, &compacted).await?;
            self.inner.cache.invalidate_file(&path).await;
            rewritten += 1;
        }
        info!(namespace, rewritten, "🔄 compaction complete");
        Ok(rewritten)
    }

    // ------------------------------------------------------------------
    // Schema: namespaces, indexes, views
    // ------------------------------------------------------------------

    /// Register (or replace) a namespace spec and persist the schema.
    ///
    /// # Errors
    ///
    /// Surfaces schema persistence failures.
    pub async fn register_namespace(&self, spec: NamespaceSpec) -> DbResult<()> {
        self.ensure_open()?;
        self.inner.router.register(spec).await;
        self.persist_schema().await
    }

    /// Register an index, backfill it from current state, and persist the
    /// schema.
    ///
    /// # Errors
    ///
    /// Duplicate names, malformed definitions, persistence failures.
    pub async fn register_index(&self, namespace: &str, def: IndexDefinition) -> DbResult<()> {
        self.ensure_open()?;
        self.inner.indexes.register(namespace, def).await?;
        for entity in self.all_live_entities(namespace).await? {
            self.inner.indexes.apply_create(namespace, &entity).await;
        }
        self.persist_schema().await
    }

    /// Register a materialized view and materialize it.
    ///
    /// # Errors
    ///
    /// Duplicate names, malformed definitions.
    pub async fn define_view(&self, definition: MvDefinition) -> DbResult<()> {
        self.ensure_open()?;
        let name = definition.name.clone();
        self.inner.views.define(definition).await?;
        self.refresh_view(&name).await
    }

    /// Re-materialize a view from its source namespace.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` for unknown views; scan failures.
    pub async fn refresh_view(&self, name: &str) -> DbResult<()> {
        self.ensure_open()?;
        let view = self
            .inner
            .views
            .view(name)
            .await
            .ok_or_else(|| ChronicleError::not_found(format!("view '{name}'")))?;
        let definition = view.definition;

        let mut entities = self.all_live_entities(&definition.source).await?;
        if let Some(raw) = &definition.filter {
            let filter = Filter::parse(raw)?.normalize();
            entities.retain(|e| filter.matches(e));
        }
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        let rows = mv::materialize_rows(&definition, &entities);
        self.inner.views.store_refresh(name, rows).await
    }

    /// Rows of a materialized view (grouped views are readable only here).
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` for unknown views.
    pub async fn view_rows(&self, name: &str) -> DbResult<Vec<Value>> {
        self.ensure_open()?;
        self.inner.views.rows(name).await
    }

    /// Registered views with staleness and row estimates.
    pub async fn list_views(&self) -> Vec<crate::mv::MaterializedView> {
        self.inner.views.list().await
    }

    /// Mark a view invalid until the next refresh.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` for unknown views.
    pub async fn invalidate_view(&self, name: &str) -> DbResult<()> {
        self.inner.views.invalidate(name).await
    }

    // ------------------------------------------------------------------
    // Observability & lifecycle
    // ------------------------------------------------------------------

    /// Engine metrics snapshot.
    pub async fn metrics(&self) -> MetricsSnapshot {
        self.inner.context.metrics.snapshot().await
    }

    /// Row-group cache statistics.
    pub async fn cache_stats(&self) -> crate::cache::RowGroupCacheStats {
        self.inner.cache.stats().await
    }

    /// Circuit-breaker metrics per direction, when breaking is enabled.
    pub async fn breaker_metrics(&self) -> Option<(BreakerMetrics, BreakerMetrics)> {
        match &self.inner.breaker {
            Some(breaker) => Some(breaker.metrics().await),
            None => None,
        }
    }

    /// Event-stream push subscription.
    #[must_use]
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<EventRecord> {
        self.inner.context.exporter.subscribe()
    }

    /// Event-stream cursor poll; the cursor is the last observed event id.
    ///
    /// # Errors
    ///
    /// Storage failures reading the archive.
    pub async fn events_since(
        &self,
        cursor: Option<Ulid>,
        limit: usize,
    ) -> DbResult<(Vec<EventRecord>, Option<Ulid>)> {
        self.inner.context.exporter.events_since(cursor, limit).await
    }

    /// Growth report per data file of a namespace, so callers can decide
    /// when to shard or [`Self::compact`].
    ///
    /// # Errors
    ///
    /// Storage failures while statting data files.
    pub async fn growth_report(
        &self,
        namespace: &str,
    ) -> DbResult<Vec<(String, crate::router::GrowthReport)>> {
        self.ensure_open()?;
        let mut reports = Vec::new();
        for path in self.inner.router.resolve_data_paths(namespace, None).await {
            let Some(meta) = self.inner.backend.stat(&path).await? else { continue };
            let Some(file) = io::load_file(&self.inner.backend, &path).await? else { continue };
            let report =
                self.inner
                    .router
                    .check_growth(&meta, file.total_rows(), file.group_count());
            reports.push((path, report));
        }
        Ok(reports)
    }

    /// Verify the backend answers probes and flushing has headroom.
    ///
    /// # Errors
    ///
    /// Storage failures (including `CIRCUIT_OPEN`) or flush lag at the hard
    /// limit.
    pub async fn health_check(&self) -> DbResult<()> {
        self.ensure_open()?;
        self.inner.backend.exists(crate::meta::META_PATH).await?;
        for status in self.inner.log.flush_status_all().await {
            if status.unflushed_count >= self.inner.config.flush.hard_limit {
                return Err(ChronicleError::internal(format!(
                    "namespace '{}' is at the unflushed hard limit",
                    status.namespace
                )));
            }
        }
        Ok(())
    }

    /// Dispose the facade: stop background work, flush within a bounded
    /// budget, persist edges and schema, clear shared state keyed to this
    /// backend identity, and reset metrics. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("disposing database");
        self.inner.cancel.cancel();
        if let Some(task) = self.inner.flusher_task.lock().await.take() {
            if let Err(err) = task.await {
                warn!("background flusher join failed: {err}");
            }
        }

        // Final flush within the disposal budget; failures are logged, never
        // propagated.
        let budget = self.inner.config.dispose_flush_budget;
        match tokio::time::timeout(budget, self.inner.flusher.flush_all(None)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!("final flush failed during disposal: {err}"),
            Err(_) => warn!("final flush exceeded the disposal budget"),
        }
        if let Err(err) = self.inner.context.relationships.persist(&self.inner.backend).await {
            warn!("edge persistence failed during disposal: {err}");
        }
        if let Err(err) = self.persist_schema().await {
            warn!("schema persistence failed during disposal: {err}");
        }

        context::release(self.inner.context.identity).await;
        self.inner.cache.clear().await;
        self.inner.views.clear();
        self.inner.indexes.clear();
        info!("✅ database disposed");
    }

    async fn persist_schema(&self) -> DbResult<()> {
        let mut schema = SchemaFile {
            namespaces: self.inner.router.specs().await,
            indexes: Vec::new(),
        };
        for (namespace, definition) in self.inner.indexes.all_definitions().await {
            schema.indexes.push(NamespaceIndexDef { namespace, definition });
        }
        schema.namespaces.sort_by(|a, b| a.name.cmp(&b.name));
        self.inner.meta.save_schema(&schema).await
    }

    /// Union of published rows and the in-memory overlay, live entities
    /// only.
    async fn all_live_entities(&self, namespace: &str) -> DbResult<Vec<Entity>> {
        let mut by_id: BTreeMap<EntityId, Entity> = BTreeMap::new();
        for path in self.inner.router.resolve_data_paths(namespace, None).await {
            let Some(file) = io::load_file(&self.inner.backend, &path).await? else { continue };
            for index in 0..file.group_count() {
                let group = match self.inner.cache.get(&path, index).await {
                    Some(group) => group,
                    None => {
                        let group = Arc::new(file.decode_group(index)?);
                        self.inner.cache.put(&path, index, Arc::clone(&group)).await;
                        group
                    }
                };
                for entity in group.entities()? {
                    match by_id.get(&entity.id) {
                        Some(existing) if existing.version >= entity.version => {}
                        _ => {
                            by_id.insert(entity.id.clone(), entity);
                        }
                    }
                }
            }
        }
        for entity in self
            .inner
            .context
            .entities
            .all_in_namespace(&namespace_path_segment(namespace))
        {
            by_id.insert(entity.id.clone(), entity);
        }
        Ok(by_id.into_values().filter(|e| !e.is_deleted()).collect())
    }

    async fn backfill_indexes(&self) -> DbResult<()> {
        let namespaces: BTreeSet<String> = self
            .inner
            .log
            .namespaces()
            .into_iter()
            .chain(
                self.inner
                    .indexes
                    .all_definitions()
                    .await
                    .into_iter()
                    .map(|(ns, _)| ns),
            )
            .collect();
        for namespace in namespaces {
            for entity in self.all_live_entities(&namespace).await? {
                self.inner.indexes.apply_create(&namespace, &entity).await;
            }
        }
        Ok(())
    }
}

/// Apply a Link/Unlink event to the relationship store. Returns whether an
/// edge changed.
fn apply_edge_event(store: &RelationshipStore, event: &EventRecord) -> bool {
    match event.op {
        EventOp::Link => {
            if let (Some(predicate), Some(counterpart)) = (&event.predicate, &event.counterpart) {
                store.link(
                    event.target.clone(),
                    predicate.clone(),
                    counterpart.clone(),
                    event.metadata.clone(),
                    event.actor.as_deref().unwrap_or("system"),
                );
                return true;
            }
            false
        }
        EventOp::Unlink => {
            if let (Some(predicate), Some(counterpart)) = (&event.predicate, &event.counterpart) {
                let key = crate::model::RelationshipKey {
                    from: event.target.clone(),
                    predicate: predicate.clone(),
                    to: counterpart.clone(),
                };
                store.unlink(&key, event.actor.as_deref().unwrap_or("system"));
                return true;
            }
            false
        }
        _ => false,
    }
}

fn event_namespace(mutation: &Mutation) -> String {
    match mutation {
        Mutation::Create { namespace, .. } => namespace_path_segment(namespace),
        Mutation::Update { id, .. } | Mutation::Delete { id } => id.namespace().to_string(),
        Mutation::Link { from, .. } | Mutation::Unlink { from, .. } => {
            from.namespace().to_string()
        }
    }
}

fn build_event(
    op: EventOp,
    target: EntityId,
    before: Option<Entity>,
    after: Option<Entity>,
    actor: &str,
    opts: &WriteOptions,
) -> EventRecord {
    EventRecord {
        id: crate::model::event::next_event_id(),
        ts: chrono::Utc::now(),
        seq: 0,
        op,
        target,
        before,
        after,
        actor: Some(actor.to_string()),
        metadata: opts.metadata.clone(),
        predicate: None,
        counterpart: None,
    }
}

fn merge_metadata(
    base: Option<Map<String, Value>>,
    payload: Option<Map<String, Value>>,
) -> Option<Map<String, Value>> {
    match (base, payload) {
        (None, None) => None,
        (Some(m), None) | (None, Some(m)) => Some(m),
        (Some(mut base), Some(payload)) => {
            base.extend(payload);
            Some(base)
        }
    }
}

/// Accept `id` as either a local id or a full `<namespace>/<local>` id in
/// the same namespace.
fn entity_id_in(namespace: &str, id: &str) -> DbResult<EntityId> {
    let ns = namespace_path_segment(namespace);
    match id.split_once('/') {
        Some((prefix, _)) if namespace_path_segment(prefix) == ns => EntityId::parse(id),
        Some(_) => Err(ChronicleError::validation(format!(
            "id '{id}' does not belong to namespace '{namespace}'"
        ))),
        None => EntityId::parse(&format!("{ns}/{id}")),
    }
}

fn parse_create(namespace: &str, item: Value) -> DbResult<Mutation> {
    let mut data = item
        .as_object()
        .cloned()
        .ok_or_else(|| ChronicleError::validation("create payload must be an object"))?;
    let entity_type = data
        .remove("$type")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "Document".to_string());
    let id = match data.remove("$id") {
        Some(Value::String(raw)) => Some(
            raw.rsplit('/')
                .next()
                .unwrap_or(raw.as_str())
                .to_string(),
        ),
        Some(_) => return Err(ChronicleError::validation("$id must be a string")),
        None => None,
    };
    // Audit fields are engine-owned.
    for reserved in ["version", "createdAt", "createdBy", "updatedAt", "updatedBy", "deletedAt", "deletedBy"] {
        data.remove(reserved);
    }
    Ok(Mutation::Create {
        namespace: namespace_path_segment(namespace),
        id,
        entity_type,
        data,
    })
}

/// Apply an update document: `$set` / `$unset` operators, or a plain map
/// treated as `$set`.
fn apply_update(
    current: &Entity,
    update: &Map<String, Value>,
    actor: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> DbResult<Entity> {
    let mut after = current.clone();
    let has_operators = update.keys().any(|k| k.starts_with('$'));

    if has_operators {
        for (op, body) in update {
            match op.as_str() {
                "$set" => {
                    let fields = body.as_object().ok_or_else(|| {
                        ChronicleError::validation("$set expects an object")
                    })?;
                    for (path, value) in fields {
                        if path.starts_with('$') {
                            return Err(ChronicleError::validation(format!(
                                "cannot set reserved field '{path}'"
                            )));
                        }
                        crate::model::value::set_path(&mut after.data, path, value.clone());
                    }
                }
                "$unset" => {
                    let fields = body.as_object().ok_or_else(|| {
                        ChronicleError::validation("$unset expects an object")
                    })?;
                    for path in fields.keys() {
                        crate::model::value::remove_path(&mut after.data, path);
                    }
                }
                other => {
                    return Err(ChronicleError::validation(format!(
                        "unknown update operator '{other}'"
                    )))
                }
            }
        }
    } else {
        for (path, value) in update {
            if path.starts_with('$') {
                return Err(ChronicleError::validation(format!(
                    "cannot set reserved field '{path}'"
                )));
            }
            after.data.insert(path.clone(), value.clone());
        }
    }

    after.version = current.version + 1;
    after.updated_at = now;
    after.updated_by = actor.to_string();
    Ok(after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_id_in_accepts_local_and_full_forms() {
        assert_eq!(
            entity_id_in("posts", "p1").unwrap(),
            EntityId::new("posts", "p1")
        );
        assert_eq!(
            entity_id_in("posts", "posts/p1").unwrap(),
            EntityId::new("posts", "p1")
        );
        assert!(entity_id_in("posts", "users/u1").is_err());
    }

    #[test]
    fn test_apply_update_set_unset() {
        let mut data = Map::new();
        data.insert("name".into(), json!("Hello"));
        data.insert("tags".into(), json!(["a"]));
        let entity = Entity::create(
            EntityId::new("posts", "p1"),
            "Post".into(),
            data,
            "t",
            chrono::Utc::now(),
        );

        let update = json!({"$set": {"name": "Hi"}, "$unset": {"tags": 1}});
        let after = apply_update(&entity, update.as_object().unwrap(), "u", chrono::Utc::now()).unwrap();
        assert_eq!(after.version, 2);
        assert_eq!(after.field("name"), Some(json!("Hi")));
        assert_eq!(after.field("tags"), None);
        assert_eq!(after.updated_by, "u");

        // Plain maps merge as $set.
        let merged = apply_update(&entity, json!({"extra": 1}).as_object().unwrap(), "u", chrono::Utc::now()).unwrap();
        assert_eq!(merged.field("extra"), Some(json!(1)));
        assert_eq!(merged.field("name"), Some(json!("Hello")));
    }

    #[test]
    fn test_parse_create_extracts_type_and_id() {
        let Mutation::Create { namespace, id, entity_type, data } =
            parse_create("Posts", json!({"$type": "Post", "$id": "posts/p1", "name": "x", "version": 99})).unwrap()
        else {
            panic!("expected create");
        };
        assert_eq!(namespace, "posts");
        assert_eq!(id.as_deref(), Some("p1"));
        assert_eq!(entity_type, "Post");
        assert_eq!(data.get("name"), Some(&json!("x")));
        // Reserved audit fields are stripped.
        assert!(data.get("version").is_none());
    }
}
