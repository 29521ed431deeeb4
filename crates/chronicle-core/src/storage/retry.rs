//! Bounded retry with exponential backoff and per-call deadlines.
//!
//! Transient failures are retried with exponential backoff and jitter before
//! surfacing; every attempt runs under a deadline whose expiry counts as a
//! transient I/O failure. Only operations with at-least-once or idempotent
//! semantics are retried: `append` and `write_conditional` run exactly one
//! attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;
use uuid::Uuid;

use super::{
    ExpectedVersion, ObjectMeta, StorageBackend, StorageError, StorageResult, WriteReceipt,
};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts per call (1 = no retries)
    pub max_attempts: u32,
    /// Backoff before the first retry
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Multiplier applied per retry
    pub backoff_factor: f64,
    /// Deadline for a single attempt
    pub call_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            backoff_factor: 2.0,
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Decorator adding retry + deadline behavior to any backend. The inner
/// backend's identity is preserved so facade state sharing is unaffected.
pub struct RetryingBackend {
    inner: Arc<dyn StorageBackend>,
    config: RetryConfig,
}

impl RetryingBackend {
    #[must_use]
    pub fn new(inner: Arc<dyn StorageBackend>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    async fn attempt<T, F, Fut>(
        &self,
        operation: &'static str,
        path: &str,
        f: &F,
    ) -> StorageResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout {
                operation,
                path: path.to_string(),
                millis: self.config.call_timeout.as_millis() as u64,
            }),
        }
    }

    /// Run a retryable operation to completion.
    async fn run<T, F, Fut>(&self, operation: &'static str, path: &str, f: F) -> StorageResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.attempt(operation, path, &f).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.config.max_attempts => {
                    let jitter = rand::thread_rng().gen_range(0.8..1.25);
                    let delay = backoff.mul_f64(jitter).min(self.config.max_backoff);
                    warn!(
                        operation,
                        path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient storage failure, backing off: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    backoff = backoff.mul_f64(self.config.backoff_factor).min(self.config.max_backoff);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Run a non-retryable operation under the deadline only.
    async fn run_once<T, F, Fut>(&self, operation: &'static str, path: &str, f: F) -> StorageResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        self.attempt(operation, path, &f).await
    }
}

#[async_trait]
impl StorageBackend for RetryingBackend {
    fn identity(&self) -> Uuid {
        self.inner.identity()
    }

    fn name(&self) -> &'static str {
        "retrying"
    }

    async fn read(&self, p: &str) -> StorageResult<Vec<u8>> {
        self.run("read", p, || self.inner.read(p)).await
    }

    async fn read_range(&self, p: &str, offset: u64, length: u64) -> StorageResult<Vec<u8>> {
        self.run("read_range", p, || self.inner.read_range(p, offset, length)).await
    }

    async fn write(&self, p: &str, data: &[u8]) -> StorageResult<WriteReceipt> {
        self.run("write", p, || self.inner.write(p, data)).await
    }

    async fn write_atomic(&self, p: &str, data: &[u8]) -> StorageResult<()> {
        self.run("write_atomic", p, || self.inner.write_atomic(p, data)).await
    }

    async fn write_conditional(
        &self,
        p: &str,
        data: &[u8],
        expected: ExpectedVersion,
    ) -> StorageResult<u64> {
        // Not idempotent: a retried attempt could double-apply.
        self.run_once("write_conditional", p, || {
            self.inner.write_conditional(p, data, expected)
        })
        .await
    }

    async fn append(&self, p: &str, data: &[u8]) -> StorageResult<()> {
        // Not idempotent either.
        self.run_once("append", p, || self.inner.append(p, data)).await
    }

    async fn delete(&self, p: &str) -> StorageResult<bool> {
        self.run("delete", p, || self.inner.delete(p)).await
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        self.run("delete_prefix", prefix, || self.inner.delete_prefix(prefix)).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        self.run("list", prefix, || self.inner.list(prefix)).await
    }

    async fn stat(&self, p: &str) -> StorageResult<Option<ObjectMeta>> {
        self.run("stat", p, || self.inner.stat(p)).await
    }

    async fn exists(&self, p: &str) -> StorageResult<bool> {
        self.run("exists", p, || self.inner.exists(p)).await
    }

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        self.run("copy", from, || self.inner.copy(from, to)).await
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.run_once("rename", from, || self.inner.rename(from, to)).await
    }

    async fn remove_dir(&self, p: &str) -> StorageResult<()> {
        self.run("remove_dir", p, || self.inner.remove_dir(p)).await
    }
}
