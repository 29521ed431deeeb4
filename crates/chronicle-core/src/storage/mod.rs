//! Pluggable blob storage.
//!
//! The engine persists everything through the [`StorageBackend`] contract:
//! whole-object and range reads, conditional and atomic writes, appends,
//! listing, and deletion. Implementations in this crate:
//!
//! - [`MemoryBackend`]: versioned in-memory object map, used by tests and
//!   ephemeral databases
//! - [`LocalFsBackend`]: directory-rooted files via `tokio::fs`, atomic
//!   replace through temp-file + rename
//! - [`RetryingBackend`]: bounded exponential-backoff retry + per-call
//!   deadline decorator
//! - [`CircuitBreaker`]: per-direction circuit breaking with optional read
//!   fallback
//!
//! Paths are forward-slash-separated and strictly relative; anything else is
//! rejected with a `PATH_TRAVERSAL` error before reaching an implementation.

pub mod circuit;
pub mod local;
pub mod memory;
pub mod path;
pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ChronicleError;

pub use circuit::{BreakerMetrics, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use local::LocalFsBackend;
pub use memory::MemoryBackend;
pub use retry::{RetryConfig, RetryingBackend};

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage failure classification
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("object not found: {path}")]
    NotFound { path: String },

    #[error("path rejected: {path} ({reason})")]
    PathTraversal { path: String, reason: &'static str },

    #[error("version conflict at {path}: expected {expected}, found {actual}")]
    VersionConflict { path: String, expected: u64, actual: u64 },

    #[error("i/o failure during {operation} on {path}: {message}")]
    Io {
        operation: &'static str,
        path: String,
        message: String,
    },

    #[error("{operation} on {path} timed out after {millis}ms")]
    Timeout {
        operation: &'static str,
        path: String,
        millis: u64,
    },

    #[error("circuit open for {direction} operations")]
    CircuitOpen { direction: &'static str },
}

impl StorageError {
    /// Whether a bounded retry may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Timeout { .. })
    }

    pub(crate) fn io(operation: &'static str, path: &str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<StorageError> for ChronicleError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { path } => Self::NotFound(path),
            StorageError::PathTraversal { path, .. } => Self::PathTraversal(path),
            StorageError::VersionConflict { path, .. } => {
                Self::VersionConflict(format!("stale write to {path}"))
            }
            e @ (StorageError::Io { .. } | StorageError::Timeout { .. }) => Self::Io(e.to_string()),
            StorageError::CircuitOpen { direction } => {
                Self::CircuitOpen(format!("{direction} circuit is open"))
            }
        }
    }
}

/// Listing/stat metadata for a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub path: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

/// Receipt returned by unconditional writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    pub size: u64,
}

/// Expected-state token for [`StorageBackend::write_conditional`]. `Absent`
/// asserts the object does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    Absent,
    At(u64),
}

/// Read-modify-write with optimistic concurrency.
///
/// `modify` receives the current bytes (None when absent) and returns the
/// replacement. Conflicting writers are retried with a fresh read up to
/// `attempts` times; the version reported by the conflict seeds the next
/// expectation. Exceeding the bound surfaces the final `VersionConflict`.
///
/// # Errors
///
/// Storage failures, or `VersionConflict` after the retry bound.
pub async fn modify_with_retry<F>(
    backend: &std::sync::Arc<dyn StorageBackend>,
    path: &str,
    attempts: u32,
    modify: F,
) -> StorageResult<u64>
where
    F: Fn(Option<&[u8]>) -> StorageResult<Vec<u8>>,
{
    // A plain read carries no version; the first conditional attempt learns
    // it from the conflict response.
    let mut known_version: Option<u64> = None;
    let mut last_error = None;

    for _ in 0..attempts.max(1) {
        let current = match backend.read(path).await {
            Ok(bytes) => Some(bytes),
            Err(StorageError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        let expectation = match (&current, known_version) {
            (None, _) => ExpectedVersion::Absent,
            (Some(_), Some(version)) => ExpectedVersion::At(version),
            (Some(_), None) => ExpectedVersion::At(0),
        };
        let next = modify(current.as_deref())?;
        match backend.write_conditional(path, &next, expectation).await {
            Ok(version) => return Ok(version),
            Err(StorageError::VersionConflict { actual, .. }) => {
                known_version = (actual > 0).then_some(actual);
                last_error = Some(StorageError::VersionConflict {
                    path: path.to_string(),
                    expected: known_version.unwrap_or(0),
                    actual,
                });
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or(StorageError::VersionConflict {
        path: path.to_string(),
        expected: 0,
        actual: 0,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_modify_with_retry_learns_version() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());

        // Creation path.
        modify_with_retry(&backend, "counter", 4, |current| {
            assert!(current.is_none());
            Ok(b"1".to_vec())
        })
        .await
        .unwrap();

        // Update path: the first conditional attempt discovers the version
        // through the conflict response and the retry succeeds.
        modify_with_retry(&backend, "counter", 4, |current| {
            let mut next = current.unwrap_or_default().to_vec();
            next.push(b'+');
            Ok(next)
        })
        .await
        .unwrap();
        assert_eq!(backend.read("counter").await.unwrap(), b"1+");
    }

    #[tokio::test]
    async fn test_modify_with_retry_exhausts_to_version_conflict() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        backend.write("contended", b"v").await.unwrap();

        // A writer that bumps the object between every read and write.
        let result = modify_with_retry(&backend, "contended", 2, |_| {
            // Sabotage: another writer advances the version first.
            futures::executor::block_on(backend.write("contended", b"interloper")).map(|_| ())?;
            Ok(b"mine".to_vec())
        })
        .await;
        assert!(matches!(result, Err(StorageError::VersionConflict { .. })));
    }
}

/// Byte-addressable blob store consumed by the engine.
///
/// Reads are expected to be retryable at-least-once; `write_atomic` must be
/// idempotent replace-or-create with no torn state observable by readers.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Stable identity of this backend instance. Facades sharing a backend
    /// (same identity) share engine state.
    fn identity(&self) -> Uuid;

    /// Implementation name for logs and metrics.
    fn name(&self) -> &'static str;

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>>;

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> StorageResult<Vec<u8>>;

    async fn write(&self, path: &str, data: &[u8]) -> StorageResult<WriteReceipt>;

    /// Replace-or-create with no torn state.
    async fn write_atomic(&self, path: &str, data: &[u8]) -> StorageResult<()>;

    /// Optimistic-concurrency write. Returns the new object version.
    async fn write_conditional(
        &self,
        path: &str,
        data: &[u8],
        expected: ExpectedVersion,
    ) -> StorageResult<u64>;

    async fn append(&self, path: &str, data: &[u8]) -> StorageResult<()>;

    async fn delete(&self, path: &str) -> StorageResult<bool>;

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize>;

    /// List objects under a prefix, ordered by path.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>>;

    async fn stat(&self, path: &str) -> StorageResult<Option<ObjectMeta>>;

    async fn exists(&self, path: &str) -> StorageResult<bool>;

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()>;

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    async fn remove_dir(&self, path: &str) -> StorageResult<()>;
}
