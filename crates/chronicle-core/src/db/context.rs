//! Engine context: shared state keyed by storage identity.
//!
//! All cross-facade state (entity snapshots, relationships, reconstruction
//! cache, query statistics, metrics, the export ring) lives in one explicit
//! context object. A process-wide registry keys contexts by the backend's
//! identity, so two facades sharing one backend instance share state, while
//! distinct backends stay isolated. Disposal clears the context
//! deterministically.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::cache::ReconstructionCache;
use crate::config::DatabaseConfig;
use crate::export::EventExporter;
use crate::filter::{FieldPredicate, Filter};
use crate::metrics::MetricsCollector;
use crate::model::namespace_path_segment;
use crate::storage::StorageBackend;
use crate::store::{EntityStore, RelationshipStore};

/// Per-field equality-lookup counters feeding `create index` suggestions.
#[derive(Default)]
pub struct QueryStatsStore {
    counts: DashMap<(String, String), u64>,
}

impl QueryStatsStore {
    /// Record the equality fields a query pins.
    pub fn record(&self, namespace: &str, filter: &Filter) {
        let ns = namespace_path_segment(namespace);
        for term in filter.conjunction_terms() {
            if let Filter::Field { path, predicate } = term {
                if matches!(predicate, FieldPredicate::Eq(_) | FieldPredicate::In(_)) {
                    *self.counts.entry((ns.clone(), path.clone())).or_insert(0) += 1;
                }
            }
        }
    }

    /// Fields queried by equality at least `threshold` times.
    #[must_use]
    pub fn frequent_fields(&self, namespace: &str, threshold: u64) -> Vec<String> {
        let ns = namespace_path_segment(namespace);
        let mut fields: Vec<String> = self
            .counts
            .iter()
            .filter(|e| e.key().0 == ns && *e.value() >= threshold)
            .map(|e| e.key().1.clone())
            .collect();
        fields.sort();
        fields
    }

    pub fn clear(&self) {
        self.counts.clear();
    }
}

/// Shared engine state for one storage identity.
pub struct DbContext {
    pub identity: Uuid,
    pub entities: Arc<EntityStore>,
    pub relationships: Arc<RelationshipStore>,
    pub reconstruction: Arc<ReconstructionCache>,
    pub query_stats: Arc<QueryStatsStore>,
    pub metrics: MetricsCollector,
    pub exporter: Arc<EventExporter>,
}

impl DbContext {
    fn new(backend: &Arc<dyn StorageBackend>, config: &DatabaseConfig) -> Self {
        Self {
            identity: backend.identity(),
            entities: Arc::new(EntityStore::new()),
            relationships: Arc::new(RelationshipStore::new()),
            reconstruction: Arc::new(ReconstructionCache::new(config.reconstruction_entries)),
            query_stats: Arc::new(QueryStatsStore::default()),
            metrics: MetricsCollector::new(),
            exporter: Arc::new(EventExporter::new(Arc::clone(backend), config.export_ring)),
        }
    }

    /// Clear every store and reset metrics.
    pub async fn clear(&self) {
        self.entities.clear();
        self.relationships.clear();
        self.reconstruction.clear().await;
        self.query_stats.clear();
        self.metrics.reset().await;
        self.exporter.clear().await;
    }
}

fn registry() -> &'static DashMap<Uuid, Arc<DbContext>> {
    static CONTEXTS: OnceLock<DashMap<Uuid, Arc<DbContext>>> = OnceLock::new();
    CONTEXTS.get_or_init(DashMap::new)
}

/// Get or create the context for a backend identity.
pub fn acquire(backend: &Arc<dyn StorageBackend>, config: &DatabaseConfig) -> Arc<DbContext> {
    registry()
        .entry(backend.identity())
        .or_insert_with(|| {
            debug!(identity = %backend.identity(), "engine context created");
            Arc::new(DbContext::new(backend, config))
        })
        .clone()
}

/// Remove and clear the context for an identity (facade disposal).
pub async fn release(identity: Uuid) {
    if let Some((_, context)) = registry().remove(&identity) {
        context.clear().await;
        debug!(identity = %identity, "engine context released");
    }
}

/// Number of live contexts (tests and leak diagnostics).
#[must_use]
pub fn live_contexts() -> usize {
    registry().len()
}
