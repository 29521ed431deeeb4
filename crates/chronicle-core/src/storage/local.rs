//! Local-filesystem storage backend.
//!
//! Objects are files under a root directory. Atomic replacement goes through
//! a temp file in the target directory followed by a rename, so readers never
//! observe torn state. Conditional writes use the file's mtime (nanoseconds)
//! as the object version.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{
    path, ExpectedVersion, ObjectMeta, StorageBackend, StorageError, StorageResult, WriteReceipt,
};

/// Directory-rooted filesystem backend.
pub struct LocalFsBackend {
    identity: Uuid,
    root: PathBuf,
}

impl LocalFsBackend {
    /// Open (creating if necessary) a backend rooted at `root`.
    ///
    /// # Errors
    ///
    /// Fails when the root directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::io("open", &root.to_string_lossy(), e))?;
        Ok(Self {
            identity: Uuid::new_v4(),
            root,
        })
    }

    fn resolve(&self, p: &str) -> StorageResult<PathBuf> {
        path::validate(p)?;
        Ok(self.root.join(p))
    }

    async fn meta_of(&self, rel: &str, full: &Path) -> StorageResult<Option<ObjectMeta>> {
        match tokio::fs::metadata(full).await {
            Ok(meta) if meta.is_file() => {
                let mtime: DateTime<Utc> = meta
                    .modified()
                    .map_err(|e| StorageError::io("stat", rel, e))?
                    .into();
                Ok(Some(ObjectMeta {
                    path: rel.to_string(),
                    size: meta.len(),
                    mtime,
                }))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io("stat", rel, e)),
        }
    }

    async fn version_of(&self, rel: &str, full: &Path) -> StorageResult<Option<u64>> {
        Ok(self.meta_of(rel, full).await?.map(|m| {
            u64::try_from(m.mtime.timestamp_nanos_opt().unwrap_or(0)).unwrap_or(0)
        }))
    }

    async fn ensure_parent(&self, full: &Path, rel: &str) -> StorageResult<()> {
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io("mkdir", rel, e))?;
        }
        Ok(())
    }

    /// Recursive walk collecting files whose relative path starts with
    /// `prefix`, ordered by path.
    async fn walk(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        let mut results = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::io("list", prefix, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::io("list", prefix, e))?
            {
                let full = entry.path();
                let rel = full
                    .strip_prefix(&self.root)
                    .map_err(|e| StorageError::io("list", prefix, e))?
                    .to_string_lossy()
                    .replace('\\', "/");
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StorageError::io("list", prefix, e))?;
                if file_type.is_dir() {
                    // Skip subtrees that cannot contain the prefix.
                    if rel.starts_with(prefix) || prefix.starts_with(&format!("{rel}/")) {
                        stack.push(full);
                    }
                } else if rel.starts_with(prefix) {
                    if let Some(meta) = self.meta_of(&rel, &full).await? {
                        results.push(meta);
                    }
                }
            }
        }
        results.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(results)
    }

    async fn write_via_temp(&self, rel: &str, full: &Path, data: &[u8]) -> StorageResult<()> {
        self.ensure_parent(full, rel).await?;
        let temp = full.with_extension(format!("tmp.{}", Uuid::new_v4().simple()));
        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| StorageError::io("write_atomic", rel, e))?;
        file.write_all(data)
            .await
            .map_err(|e| StorageError::io("write_atomic", rel, e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io("write_atomic", rel, e))?;
        drop(file);
        tokio::fs::rename(&temp, full)
            .await
            .map_err(|e| StorageError::io("write_atomic", rel, e))
    }
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    fn identity(&self) -> Uuid {
        self.identity
    }

    fn name(&self) -> &'static str {
        "local-fs"
    }

    async fn read(&self, p: &str) -> StorageResult<Vec<u8>> {
        let full = self.resolve(p)?;
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound { path: p.to_string() })
            }
            Err(e) => Err(StorageError::io("read", p, e)),
        }
    }

    async fn read_range(&self, p: &str, offset: u64, length: u64) -> StorageResult<Vec<u8>> {
        let data = self.read(p).await?;
        let start = (offset as usize).min(data.len());
        let end = (offset.saturating_add(length) as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn write(&self, p: &str, data: &[u8]) -> StorageResult<WriteReceipt> {
        let full = self.resolve(p)?;
        self.ensure_parent(&full, p).await?;
        tokio::fs::write(&full, data)
            .await
            .map_err(|e| StorageError::io("write", p, e))?;
        Ok(WriteReceipt { size: data.len() as u64 })
    }

    async fn write_atomic(&self, p: &str, data: &[u8]) -> StorageResult<()> {
        let full = self.resolve(p)?;
        self.write_via_temp(p, &full, data).await
    }

    async fn write_conditional(
        &self,
        p: &str,
        data: &[u8],
        expected: ExpectedVersion,
    ) -> StorageResult<u64> {
        let full = self.resolve(p)?;
        let current = self.version_of(p, &full).await?;
        match (expected, current) {
            (ExpectedVersion::Absent, None) => {}
            (ExpectedVersion::At(v), Some(actual)) if v == actual => {}
            (ExpectedVersion::Absent, Some(actual)) => {
                return Err(StorageError::VersionConflict {
                    path: p.to_string(),
                    expected: 0,
                    actual,
                })
            }
            (ExpectedVersion::At(v), actual) => {
                return Err(StorageError::VersionConflict {
                    path: p.to_string(),
                    expected: v,
                    actual: actual.unwrap_or(0),
                })
            }
        }
        self.write_via_temp(p, &full, data).await?;
        Ok(self.version_of(p, &full).await?.unwrap_or(0))
    }

    async fn append(&self, p: &str, data: &[u8]) -> StorageResult<()> {
        let full = self.resolve(p)?;
        self.ensure_parent(&full, p).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full)
            .await
            .map_err(|e| StorageError::io("append", p, e))?;
        file.write_all(data)
            .await
            .map_err(|e| StorageError::io("append", p, e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io("append", p, e))
    }

    async fn delete(&self, p: &str) -> StorageResult<bool> {
        let full = self.resolve(p)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io("delete", p, e)),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        path::validate_prefix(prefix)?;
        let listed = self.walk(prefix).await?;
        let mut removed = 0;
        for meta in listed {
            if self.delete(&meta.path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        path::validate_prefix(prefix)?;
        self.walk(prefix).await
    }

    async fn stat(&self, p: &str) -> StorageResult<Option<ObjectMeta>> {
        let full = self.resolve(p)?;
        self.meta_of(p, &full).await
    }

    async fn exists(&self, p: &str) -> StorageResult<bool> {
        Ok(self.stat(p).await?.is_some())
    }

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        self.ensure_parent(&dst, to).await?;
        match tokio::fs::copy(&src, &dst).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound { path: from.to_string() })
            }
            Err(e) => Err(StorageError::io("copy", from, e)),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        self.ensure_parent(&dst, to).await?;
        match tokio::fs::rename(&src, &dst).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound { path: from.to_string() })
            }
            Err(e) => Err(StorageError::io("rename", from, e)),
        }
    }

    async fn remove_dir(&self, p: &str) -> StorageResult<()> {
        let full = self.resolve(p)?;
        match tokio::fs::remove_dir_all(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io("remove_dir", p, e)),
        }
    }
}
