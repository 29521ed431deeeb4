//! Per-namespace handle.
//!
//! `Collection` binds the top-level API to one namespace with exact
//! behavioral parity; every call delegates to the facade. Namespace names
//! are normalized to camelCase for lookup, while path generation always
//! lowercases.

use futures::Stream;
use serde_json::{Map, Value};

use crate::error::DbResult;
use crate::event::FlushStatus;
use crate::index::IndexDefinition;
use crate::ingest::{IngestHooks, IngestReport, Transform};
use crate::model::{normalize_namespace, EdgeDirection, Relationship};
use crate::query::{QueryOptions, QueryResult, WriteOptions};

use super::database::Database;

/// A namespace-bound view over the database facade.
#[derive(Clone)]
pub struct Collection {
    db: Database,
    namespace: String,
}

impl Collection {
    pub(crate) fn new(db: Database, name: &str) -> Self {
        Self {
            db,
            namespace: normalize_namespace(name),
        }
    }

    /// The normalized namespace this handle is bound to.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// See [`Database::find`].
    ///
    /// # Errors
    ///
    /// As [`Database::find`].
    pub async fn find(&self, filter: Value, opts: &QueryOptions) -> DbResult<QueryResult> {
        self.db.find(&self.namespace, filter, opts).await
    }

    /// See [`Database::get`].
    ///
    /// # Errors
    ///
    /// As [`Database::get`].
    pub async fn get(&self, id: &str, opts: &QueryOptions) -> DbResult<Value> {
        self.db.get(&self.namespace, id, opts).await
    }

    /// See [`Database::create`].
    ///
    /// # Errors
    ///
    /// As [`Database::create`].
    pub async fn create(&self, data: Value, opts: &WriteOptions) -> DbResult<Value> {
        self.db.create(&self.namespace, data, opts).await
    }

    /// See [`Database::create_many`].
    ///
    /// # Errors
    ///
    /// As [`Database::create_many`].
    pub async fn create_many(&self, items: Vec<Value>, opts: &WriteOptions) -> DbResult<Vec<Value>> {
        self.db.create_many(&self.namespace, items, opts).await
    }

    /// See [`Database::update`].
    ///
    /// # Errors
    ///
    /// As [`Database::update`].
    pub async fn update(&self, id: &str, update: Value, opts: &WriteOptions) -> DbResult<Value> {
        self.db.update(&self.namespace, id, update, opts).await
    }

    /// See [`Database::delete`].
    ///
    /// # Errors
    ///
    /// As [`Database::delete`].
    pub async fn delete(&self, id: &str, opts: &WriteOptions) -> DbResult<()> {
        self.db.delete(&self.namespace, id, opts).await
    }

    /// See [`Database::count`].
    ///
    /// # Errors
    ///
    /// As [`Database::count`].
    pub async fn count(&self, filter: Value, opts: &QueryOptions) -> DbResult<usize> {
        self.db.count(&self.namespace, filter, opts).await
    }

    /// See [`Database::exists`].
    ///
    /// # Errors
    ///
    /// As [`Database::exists`].
    pub async fn exists(&self, id: &str) -> DbResult<bool> {
        self.db.exists(&self.namespace, id).await
    }

    /// Link from an entity in this namespace. `from` may be a local id.
    ///
    /// # Errors
    ///
    /// As [`Database::link`].
    pub async fn link(
        &self,
        from: &str,
        predicate: &str,
        to: &str,
        payload: Option<Map<String, Value>>,
        opts: &WriteOptions,
    ) -> DbResult<Relationship> {
        let from = self.qualify(from);
        self.db.link(&from, predicate, to, payload, opts).await
    }

    /// See [`Database::unlink`].
    ///
    /// # Errors
    ///
    /// As [`Database::unlink`].
    pub async fn unlink(&self, from: &str, predicate: &str, to: &str, opts: &WriteOptions) -> DbResult<()> {
        let from = self.qualify(from);
        self.db.unlink(&from, predicate, to, opts).await
    }

    /// See [`Database::get_relationships`].
    ///
    /// # Errors
    ///
    /// As [`Database::get_relationships`].
    pub async fn get_relationships(
        &self,
        id: &str,
        direction: EdgeDirection,
        predicate: Option<&str>,
    ) -> DbResult<Vec<Relationship>> {
        let id = self.qualify(id);
        self.db.get_relationships(&id, direction, predicate).await
    }

    /// See [`Database::ingest_stream`].
    ///
    /// # Errors
    ///
    /// As [`Database::ingest_stream`].
    pub async fn ingest_stream<S>(
        &self,
        records: S,
        transform: Option<Transform>,
        hooks: IngestHooks,
        opts: &WriteOptions,
    ) -> DbResult<IngestReport>
    where
        S: Stream<Item = DbResult<Value>> + Unpin,
    {
        self.db
            .ingest_stream(&self.namespace, records, transform, hooks, opts)
            .await
    }

    /// See [`Database::flush`].
    ///
    /// # Errors
    ///
    /// As [`Database::flush`].
    pub async fn flush(&self) -> DbResult<Vec<crate::event::FlushOutcome>> {
        self.db.flush(Some(&self.namespace)).await
    }

    /// See [`Database::get_flush_status`].
    pub async fn get_flush_status(&self) -> Vec<FlushStatus> {
        self.db.get_flush_status(Some(&self.namespace)).await
    }

    /// See [`Database::register_index`].
    ///
    /// # Errors
    ///
    /// As [`Database::register_index`].
    pub async fn register_index(&self, def: IndexDefinition) -> DbResult<()> {
        self.db.register_index(&self.namespace, def).await
    }

    fn qualify(&self, id: &str) -> String {
        if id.contains('/') {
            id.to_string()
        } else {
            format!("{}/{id}", crate::model::namespace_path_segment(&self.namespace))
        }
    }
}
