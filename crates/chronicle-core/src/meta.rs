//! Engine metadata persistence.
//!
//! Two small control files live at the backend root:
//!
//! - `_meta.parquet`: the pending row-group table used by the flush pipeline
//!   and crash recovery (bincode, checksummed frame)
//! - `_schema.parquet`: registered namespace specs and index definitions
//!   (JSON body inside the same frame, since shard strategies use tagged
//!   enums)

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ChronicleError, DbResult};
use crate::frame;
use crate::index::IndexDefinition;
use crate::router::NamespaceSpec;
use crate::storage::{StorageBackend, StorageError};

/// Pending row-group table path.
pub const META_PATH: &str = "_meta.parquet";
/// Namespace/index schema path.
pub const SCHEMA_PATH: &str = "_schema.parquet";
/// Relationship archive path.
pub const EDGES_PATH: &str = "_edges.parquet";
/// Event export archive path.
pub const EVENTS_PATH: &str = "_events.parquet";

const META_MAGIC: [u8; 4] = *b"CHMT";
const SCHEMA_MAGIC: [u8; 4] = *b"CHSC";

/// One promoted group inside a pending row-group file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingGroupRef {
    pub group_id: String,
    /// Data file the group merges into.
    pub target_path: String,
}

/// Record of a written-but-not-yet-committed row-group file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecord {
    /// ULID naming the pending file.
    pub id: String,
    pub namespace: String,
    pub pending_path: String,
    pub first_seq: u64,
    pub last_seq: u64,
    pub groups: Vec<PendingGroupRef>,
}

/// The pending row-group table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFile {
    pub pending: Vec<PendingRecord>,
}

/// Registered index definition tied to a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceIndexDef {
    pub namespace: String,
    pub definition: IndexDefinition,
}

/// Persisted namespace specs and index definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaFile {
    pub namespaces: Vec<NamespaceSpec>,
    pub indexes: Vec<NamespaceIndexDef>,
}

/// Loader/saver for the control files.
pub struct MetaStore {
    backend: Arc<dyn StorageBackend>,
}

impl MetaStore {
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Load the pending table; a missing file is an empty table.
    ///
    /// # Errors
    ///
    /// Fails on storage errors other than not-found, or corrupt contents.
    pub async fn load_meta(&self) -> DbResult<MetaFile> {
        match self.backend.read(META_PATH).await {
            Ok(bytes) => {
                let body = frame::decode(META_MAGIC, &bytes)?;
                bincode::deserialize(&body)
                    .map_err(|e| ChronicleError::internal(format!("meta decode failed: {e}")))
            }
            Err(StorageError::NotFound { .. }) => Ok(MetaFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the pending table.
    ///
    /// # Errors
    ///
    /// Fails when encoding or the write fails.
    pub async fn save_meta(&self, meta: &MetaFile) -> DbResult<()> {
        let body = bincode::serialize(meta)
            .map_err(|e| ChronicleError::internal(format!("meta encode failed: {e}")))?;
        self.backend
            .write_atomic(META_PATH, &frame::encode(META_MAGIC, &body))
            .await?;
        Ok(())
    }

    /// Read-modify-write of the pending table with optimistic concurrency:
    /// two facades sharing one backend may race on it, so conflicting
    /// writers retry with a fresh read up to a small bound before
    /// surfacing `VERSION_CONFLICT`.
    async fn modify_pending(
        &self,
        mutate: impl Fn(&mut MetaFile) + Send + Sync,
    ) -> DbResult<()> {
        crate::storage::modify_with_retry(&self.backend, META_PATH, 4, |current| {
            let mut meta = match current {
                None => MetaFile::default(),
                Some(bytes) => frame::decode(META_MAGIC, bytes)
                    .ok()
                    .and_then(|body| bincode::deserialize(&body).ok())
                    .unwrap_or_default(),
            };
            mutate(&mut meta);
            let body = bincode::serialize(&meta).map_err(|e| StorageError::Io {
                operation: "write_conditional",
                path: META_PATH.to_string(),
                message: format!("meta encode failed: {e}"),
            })?;
            Ok(frame::encode(META_MAGIC, &body))
        })
        .await?;
        Ok(())
    }

    /// Append a pending record (flush step 3).
    ///
    /// # Errors
    ///
    /// Fails when the table cannot be updated.
    pub async fn record_pending(&self, record: PendingRecord) -> DbResult<()> {
        self.modify_pending(move |meta| {
            meta.pending.retain(|p| p.id != record.id);
            meta.pending.push(record.clone());
        })
        .await
    }

    /// Drop a pending record once its groups are committed (flush step 5).
    ///
    /// # Errors
    ///
    /// Fails when the table cannot be updated.
    pub async fn remove_pending(&self, id: &str) -> DbResult<()> {
        self.modify_pending(move |meta| {
            meta.pending.retain(|p| p.id != id);
        })
        .await
    }

    /// Load the schema file; a missing file is an empty schema.
    ///
    /// # Errors
    ///
    /// Fails on storage errors other than not-found, or corrupt contents.
    pub async fn load_schema(&self) -> DbResult<SchemaFile> {
        match self.backend.read(SCHEMA_PATH).await {
            Ok(bytes) => {
                let body = frame::decode(SCHEMA_MAGIC, &bytes)?;
                serde_json::from_slice(&body)
                    .map_err(|e| ChronicleError::internal(format!("schema decode failed: {e}")))
            }
            Err(StorageError::NotFound { .. }) => Ok(SchemaFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the schema file.
    ///
    /// # Errors
    ///
    /// Fails when encoding or the write fails.
    pub async fn save_schema(&self, schema: &SchemaFile) -> DbResult<()> {
        let body = serde_json::to_vec(schema)
            .map_err(|e| ChronicleError::internal(format!("schema encode failed: {e}")))?;
        self.backend
            .write_atomic(SCHEMA_PATH, &frame::encode(SCHEMA_MAGIC, &body))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn record(id: &str) -> PendingRecord {
        PendingRecord {
            id: id.to_string(),
            namespace: "posts".into(),
            pending_path: format!("posts/_pending/{id}.parquet"),
            first_seq: 1,
            last_seq: 2,
            groups: vec![PendingGroupRef {
                group_id: format!("{id}-0"),
                target_path: "data/posts/data.parquet".into(),
            }],
        }
    }

    #[tokio::test]
    async fn test_meta_round_trip() {
        let store = MetaStore::new(Arc::new(MemoryBackend::new()));
        assert!(store.load_meta().await.unwrap().pending.is_empty());

        store.record_pending(record("01A")).await.unwrap();
        store.record_pending(record("01B")).await.unwrap();
        assert_eq!(store.load_meta().await.unwrap().pending.len(), 2);

        store.remove_pending("01A").await.unwrap();
        let meta = store.load_meta().await.unwrap();
        assert_eq!(meta.pending.len(), 1);
        assert_eq!(meta.pending[0].id, "01B");
    }

    #[tokio::test]
    async fn test_schema_round_trip() {
        let store = MetaStore::new(Arc::new(MemoryBackend::new()));
        let mut schema = SchemaFile::default();
        schema.namespaces.push(crate::router::NamespaceSpec::typed("users"));
        store.save_schema(&schema).await.unwrap();

        let loaded = store.load_schema().await.unwrap();
        assert_eq!(loaded.namespaces.len(), 1);
        assert_eq!(loaded.namespaces[0].name, "users");
    }
}
