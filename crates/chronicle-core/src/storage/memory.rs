//! In-memory storage backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    path, ExpectedVersion, ObjectMeta, StorageBackend, StorageError, StorageResult, WriteReceipt,
};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Arc<Vec<u8>>,
    version: u64,
    mtime: chrono::DateTime<Utc>,
}

/// Versioned in-memory object map. Every instance has a distinct identity, so
/// two facades only share engine state when they share one `MemoryBackend`.
pub struct MemoryBackend {
    identity: Uuid,
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            identity: Uuid::new_v4(),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of stored objects, for tests and diagnostics.
    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    fn meta(path: &str, object: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: object.data.len() as u64,
            mtime: object.mtime,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn identity(&self) -> Uuid {
        self.identity
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, p: &str) -> StorageResult<Vec<u8>> {
        path::validate(p)?;
        let objects = self.objects.read().await;
        objects
            .get(p)
            .map(|o| o.data.as_ref().clone())
            .ok_or_else(|| StorageError::NotFound { path: p.to_string() })
    }

    async fn read_range(&self, p: &str, offset: u64, length: u64) -> StorageResult<Vec<u8>> {
        let data = self.read(p).await?;
        let start = (offset as usize).min(data.len());
        let end = (offset.saturating_add(length) as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn write(&self, p: &str, data: &[u8]) -> StorageResult<WriteReceipt> {
        path::validate(p)?;
        let mut objects = self.objects.write().await;
        let version = objects.get(p).map_or(1, |o| o.version + 1);
        objects.insert(
            p.to_string(),
            StoredObject {
                data: Arc::new(data.to_vec()),
                version,
                mtime: Utc::now(),
            },
        );
        Ok(WriteReceipt { size: data.len() as u64 })
    }

    async fn write_atomic(&self, p: &str, data: &[u8]) -> StorageResult<()> {
        // A single map insert under the write lock is already atomic.
        self.write(p, data).await.map(|_| ())
    }

    async fn write_conditional(
        &self,
        p: &str,
        data: &[u8],
        expected: ExpectedVersion,
    ) -> StorageResult<u64> {
        path::validate(p)?;
        let mut objects = self.objects.write().await;
        let current = objects.get(p).map(|o| o.version);
        let next = match (expected, current) {
            (ExpectedVersion::Absent, None) => 1,
            (ExpectedVersion::Absent, Some(actual)) => {
                return Err(StorageError::VersionConflict {
                    path: p.to_string(),
                    expected: 0,
                    actual,
                })
            }
            (ExpectedVersion::At(v), Some(actual)) if v == actual => actual + 1,
            (ExpectedVersion::At(v), actual) => {
                return Err(StorageError::VersionConflict {
                    path: p.to_string(),
                    expected: v,
                    actual: actual.unwrap_or(0),
                })
            }
        };
        objects.insert(
            p.to_string(),
            StoredObject {
                data: Arc::new(data.to_vec()),
                version: next,
                mtime: Utc::now(),
            },
        );
        Ok(next)
    }

    async fn append(&self, p: &str, data: &[u8]) -> StorageResult<()> {
        path::validate(p)?;
        let mut objects = self.objects.write().await;
        match objects.get_mut(p) {
            Some(existing) => {
                let mut combined = existing.data.as_ref().clone();
                combined.extend_from_slice(data);
                existing.data = Arc::new(combined);
                existing.version += 1;
                existing.mtime = Utc::now();
            }
            None => {
                objects.insert(
                    p.to_string(),
                    StoredObject {
                        data: Arc::new(data.to_vec()),
                        version: 1,
                        mtime: Utc::now(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn delete(&self, p: &str) -> StorageResult<bool> {
        path::validate(p)?;
        Ok(self.objects.write().await.remove(p).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        path::validate_prefix(prefix)?;
        let mut objects = self.objects.write().await;
        let keys: Vec<String> = objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            objects.remove(key);
        }
        Ok(keys.len())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        path::validate_prefix(prefix)?;
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| Self::meta(k, o))
            .collect())
    }

    async fn stat(&self, p: &str) -> StorageResult<Option<ObjectMeta>> {
        path::validate(p)?;
        Ok(self.objects.read().await.get(p).map(|o| Self::meta(p, o)))
    }

    async fn exists(&self, p: &str) -> StorageResult<bool> {
        path::validate(p)?;
        Ok(self.objects.read().await.contains_key(p))
    }

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        path::validate(from)?;
        path::validate(to)?;
        let mut objects = self.objects.write().await;
        let source = objects
            .get(from)
            .cloned()
            .ok_or_else(|| StorageError::NotFound { path: from.to_string() })?;
        let version = objects.get(to).map_or(1, |o| o.version + 1);
        objects.insert(
            to.to_string(),
            StoredObject {
                data: source.data,
                version,
                mtime: Utc::now(),
            },
        );
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.copy(from, to).await?;
        self.delete(from).await.map(|_| ())
    }

    async fn remove_dir(&self, p: &str) -> StorageResult<()> {
        path::validate(p)?;
        self.delete_prefix(&format!("{p}/")).await.map(|_| ())
    }
}
