//! Circuit breaker for storage backends.
//!
//! Wraps a [`StorageBackend`] and trips per direction (read / write) after a
//! run of consecutive transient failures. While open, calls fast-fail with a
//! `CIRCUIT_OPEN` error; reads may instead be routed to a fallback backend.
//! After the reset timeout the first request is admitted as a half-open
//! probe, and a run of probe successes closes the circuit again.
//!
//! Non-transient errors (not-found, version conflicts, path rejections) are
//! healthy responses from the backend's point of view and count as successes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ExpectedVersion, ObjectMeta, StorageBackend, StorageError, StorageResult, WriteReceipt,
};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures that open the circuit
    pub failure_threshold: u32,
    /// Half-open successes that close the circuit
    pub success_threshold: u32,
    /// Time an open circuit waits before admitting a probe
    pub reset_timeout: Duration,
    /// Track reads and writes in separate circuits
    pub split_directions: bool,
    /// Let `stat` / `exists` probes bypass the breaker entirely
    pub bypass_probes: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            split_directions: true,
            bypass_probes: false,
        }
    }
}

/// Per-direction call metrics
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub fallback_calls: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

impl Direction {
    const fn label(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

#[derive(Debug)]
struct DirectionState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    fallback_calls: u64,
}

impl DirectionState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            fallback_calls: 0,
        }
    }

    fn metrics(&self) -> BreakerMetrics {
        BreakerMetrics {
            state: self.state,
            total_calls: self.total_calls,
            successful_calls: self.successful_calls,
            failed_calls: self.failed_calls,
            fallback_calls: self.fallback_calls,
        }
    }
}

/// Circuit-breaking decorator. The inner backend's identity is preserved.
pub struct CircuitBreaker {
    inner: Arc<dyn StorageBackend>,
    fallback: Option<Arc<dyn StorageBackend>>,
    config: CircuitBreakerConfig,
    read: Mutex<DirectionState>,
    write: Mutex<DirectionState>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(inner: Arc<dyn StorageBackend>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            fallback: None,
            config,
            read: Mutex::new(DirectionState::new()),
            write: Mutex::new(DirectionState::new()),
        }
    }

    /// Route reads to `fallback` while the read circuit is open. Writes never
    /// fall back.
    #[must_use]
    pub fn with_read_fallback(mut self, fallback: Arc<dyn StorageBackend>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Current metrics for both directions.
    pub async fn metrics(&self) -> (BreakerMetrics, BreakerMetrics) {
        let read = self.read.lock().await.metrics();
        let write = if self.config.split_directions {
            self.write.lock().await.metrics()
        } else {
            read
        };
        (read, write)
    }

    fn slot(&self, direction: Direction) -> &Mutex<DirectionState> {
        match direction {
            Direction::Write if self.config.split_directions => &self.write,
            _ => &self.read,
        }
    }

    /// Admission check. Returns an error while the circuit is open and the
    /// reset timeout has not elapsed.
    async fn admit(&self, direction: Direction) -> StorageResult<()> {
        let mut slot = self.slot(direction).lock().await;
        slot.total_calls += 1;
        match slot.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = slot.opened_at.map_or(Duration::ZERO, |t| t.elapsed());
                if elapsed >= self.config.reset_timeout {
                    slot.state = CircuitState::HalfOpen;
                    slot.half_open_successes = 0;
                    debug!(direction = direction.label(), "circuit half-open, admitting probe");
                    Ok(())
                } else {
                    slot.failed_calls += 1;
                    Err(StorageError::CircuitOpen { direction: direction.label() })
                }
            }
        }
    }

    async fn record(&self, direction: Direction, healthy: bool) {
        let mut slot = self.slot(direction).lock().await;
        if healthy {
            slot.successful_calls += 1;
            match slot.state {
                CircuitState::HalfOpen => {
                    slot.half_open_successes += 1;
                    if slot.half_open_successes >= self.config.success_threshold {
                        slot.state = CircuitState::Closed;
                        slot.consecutive_failures = 0;
                        slot.opened_at = None;
                        info!(direction = direction.label(), "✅ circuit closed");
                    }
                }
                _ => slot.consecutive_failures = 0,
            }
        } else {
            slot.failed_calls += 1;
            match slot.state {
                CircuitState::HalfOpen => {
                    slot.state = CircuitState::Open;
                    slot.opened_at = Some(Instant::now());
                    warn!(direction = direction.label(), "circuit re-opened by failed probe");
                }
                CircuitState::Closed => {
                    slot.consecutive_failures += 1;
                    if slot.consecutive_failures >= self.config.failure_threshold {
                        slot.state = CircuitState::Open;
                        slot.opened_at = Some(Instant::now());
                        warn!(
                            direction = direction.label(),
                            failures = slot.consecutive_failures,
                            "⚡ circuit opened"
                        );
                    }
                }
                CircuitState::Open => {}
            }
        }
    }

    async fn note_fallback(&self) {
        let mut slot = self.read.lock().await;
        slot.fallback_calls += 1;
    }

    async fn guarded<T, F, Fut>(&self, direction: Direction, f: F) -> StorageResult<T>
    where
        F: Fn(Arc<dyn StorageBackend>) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        match self.admit(direction).await {
            Ok(()) => {
                let result = f(Arc::clone(&self.inner)).await;
                let healthy = match &result {
                    Ok(_) => true,
                    Err(err) => !err.is_transient(),
                };
                self.record(direction, healthy).await;
                result
            }
            Err(open) => {
                if direction == Direction::Read {
                    if let Some(fallback) = &self.fallback {
                        self.note_fallback().await;
                        return f(Arc::clone(fallback)).await;
                    }
                }
                Err(open)
            }
        }
    }
}

#[async_trait]
impl StorageBackend for CircuitBreaker {
    fn identity(&self) -> Uuid {
        self.inner.identity()
    }

    fn name(&self) -> &'static str {
        "circuit-breaker"
    }

    async fn read(&self, p: &str) -> StorageResult<Vec<u8>> {
        self.guarded(Direction::Read, |b| async move { b.read(p).await }).await
    }

    async fn read_range(&self, p: &str, offset: u64, length: u64) -> StorageResult<Vec<u8>> {
        self.guarded(Direction::Read, |b| async move { b.read_range(p, offset, length).await })
            .await
    }

    async fn write(&self, p: &str, data: &[u8]) -> StorageResult<WriteReceipt> {
        self.guarded(Direction::Write, |b| async move { b.write(p, data).await }).await
    }

    async fn write_atomic(&self, p: &str, data: &[u8]) -> StorageResult<()> {
        self.guarded(Direction::Write, |b| async move { b.write_atomic(p, data).await })
            .await
    }

    async fn write_conditional(
        &self,
        p: &str,
        data: &[u8],
        expected: ExpectedVersion,
    ) -> StorageResult<u64> {
        self.guarded(Direction::Write, |b| async move {
            b.write_conditional(p, data, expected).await
        })
        .await
    }

    async fn append(&self, p: &str, data: &[u8]) -> StorageResult<()> {
        self.guarded(Direction::Write, |b| async move { b.append(p, data).await }).await
    }

    async fn delete(&self, p: &str) -> StorageResult<bool> {
        self.guarded(Direction::Write, |b| async move { b.delete(p).await }).await
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        self.guarded(Direction::Write, |b| async move { b.delete_prefix(prefix).await })
            .await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        self.guarded(Direction::Read, |b| async move { b.list(prefix).await }).await
    }

    async fn stat(&self, p: &str) -> StorageResult<Option<ObjectMeta>> {
        if self.config.bypass_probes {
            return self.inner.stat(p).await;
        }
        self.guarded(Direction::Read, |b| async move { b.stat(p).await }).await
    }

    async fn exists(&self, p: &str) -> StorageResult<bool> {
        if self.config.bypass_probes {
            return self.inner.exists(p).await;
        }
        self.guarded(Direction::Read, |b| async move { b.exists(p).await }).await
    }

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        self.guarded(Direction::Write, |b| async move { b.copy(from, to).await }).await
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.guarded(Direction::Write, |b| async move { b.rename(from, to).await }).await
    }

    async fn remove_dir(&self, p: &str) -> StorageResult<()> {
        self.guarded(Direction::Write, |b| async move { b.remove_dir(p).await }).await
    }
}
