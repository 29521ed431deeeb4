//! Shared fixtures for the integration suite.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chronicle_core::storage::{
    ExpectedVersion, ObjectMeta, StorageBackend, StorageError, StorageResult, WriteReceipt,
};
use chronicle_core::{Database, DatabaseConfig, MemoryBackend};
use serde_json::{json, Value};
use uuid::Uuid;

/// Open a database over a fresh in-memory backend, returning both.
pub async fn open_memory_db() -> (Arc<dyn StorageBackend>, Database) {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let db = Database::open(Arc::clone(&backend), fast_config())
        .await
        .expect("open database");
    (backend, db)
}

/// Configuration tuned for tests: small thresholds, no breaker surprises.
pub fn fast_config() -> DatabaseConfig {
    let mut config = DatabaseConfig::default();
    config.flush.flush_threshold = 1_000;
    config.flush.max_wait = std::time::Duration::from_secs(3600);
    config.flush.interval = std::time::Duration::from_millis(50);
    config.ingest.batch_size = 10;
    config
}

/// A post document with a name.
pub fn post(name: &str) -> Value {
    json!({"$type": "Post", "name": name})
}

/// A user document with a status/age payload.
pub fn user(local: &str, status: &str, age: i64) -> Value {
    json!({"$id": local, "$type": "User", "status": status, "age": age})
}

/// Backend that fails reads with a transient error while `failing` is set.
/// Writes pass through so fixtures can be seeded.
pub struct OutageBackend {
    identity: Uuid,
    pub failing: AtomicBool,
    inner: MemoryBackend,
}

impl OutageBackend {
    pub fn new() -> Self {
        Self {
            identity: Uuid::new_v4(),
            failing: AtomicBool::new(false),
            inner: MemoryBackend::new(),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn gate(&self) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Io {
                operation: "read",
                path: "<outage>".into(),
                message: "injected outage".into(),
            })
        } else {
            Ok(())
        }
    }
}

impl Default for OutageBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for OutageBackend {
    fn identity(&self) -> Uuid {
        self.identity
    }
    fn name(&self) -> &'static str {
        "outage"
    }
    async fn read(&self, p: &str) -> StorageResult<Vec<u8>> {
        self.gate()?;
        self.inner.read(p).await
    }
    async fn read_range(&self, p: &str, o: u64, l: u64) -> StorageResult<Vec<u8>> {
        self.gate()?;
        self.inner.read_range(p, o, l).await
    }
    async fn write(&self, p: &str, d: &[u8]) -> StorageResult<WriteReceipt> {
        self.inner.write(p, d).await
    }
    async fn write_atomic(&self, p: &str, d: &[u8]) -> StorageResult<()> {
        self.inner.write_atomic(p, d).await
    }
    async fn write_conditional(
        &self,
        p: &str,
        d: &[u8],
        e: ExpectedVersion,
    ) -> StorageResult<u64> {
        self.inner.write_conditional(p, d, e).await
    }
    async fn append(&self, p: &str, d: &[u8]) -> StorageResult<()> {
        self.inner.append(p, d).await
    }
    async fn delete(&self, p: &str) -> StorageResult<bool> {
        self.inner.delete(p).await
    }
    async fn delete_prefix(&self, p: &str) -> StorageResult<usize> {
        self.inner.delete_prefix(p).await
    }
    async fn list(&self, p: &str) -> StorageResult<Vec<ObjectMeta>> {
        self.gate()?;
        self.inner.list(p).await
    }
    async fn stat(&self, p: &str) -> StorageResult<Option<ObjectMeta>> {
        self.gate()?;
        self.inner.stat(p).await
    }
    async fn exists(&self, p: &str) -> StorageResult<bool> {
        self.gate()?;
        self.inner.exists(p).await
    }
    async fn copy(&self, f: &str, t: &str) -> StorageResult<()> {
        self.inner.copy(f, t).await
    }
    async fn rename(&self, f: &str, t: &str) -> StorageResult<()> {
        self.inner.rename(f, t).await
    }
    async fn remove_dir(&self, p: &str) -> StorageResult<()> {
        self.inner.remove_dir(p).await
    }
}
