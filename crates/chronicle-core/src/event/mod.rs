//! The append-only event log.
//!
//! Every accepted mutation becomes one or more [`EventRecord`]s with dense,
//! strictly increasing per-namespace sequence numbers. Events are buffered in
//! memory with byte accounting, made durable in the WAL, and periodically
//! flushed into columnar row groups by the [`flush`] pipeline, after which
//! the covered WAL entries are truncated.

pub mod flush;
pub mod recovery;
pub mod wal;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::model::{namespace_path_segment, EntityId, EventRecord};
use crate::storage::StorageBackend;

pub use flush::{FlushOutcome, Flusher};
pub use wal::{WalEntryMeta, WalStore};

/// Flush and backpressure configuration
#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// Buffered entries that schedule a flush
    pub flush_threshold: usize,
    /// Buffered bytes that schedule a flush
    pub byte_threshold: usize,
    /// Maximum time a non-empty buffer waits before flushing
    pub max_wait: Duration,
    /// Unflushed entries beyond which new mutations block
    pub hard_limit: usize,
    /// Background flusher tick interval
    pub interval: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 1_000,
            byte_threshold: 8 * 1024 * 1024,
            max_wait: Duration::from_secs(5),
            hard_limit: 50_000,
            interval: Duration::from_millis(500),
        }
    }
}

/// Flush lag observable by callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushStatus {
    pub namespace: String,
    pub unflushed_count: usize,
    pub unflushed_bytes: usize,
    pub last_seq: u64,
}

#[derive(Debug)]
struct NamespaceLogState {
    last_seq: u64,
    buffer: Vec<EventRecord>,
    buffer_bytes: usize,
    last_flush_at: Instant,
}

/// Per-namespace serialization points and buffered tail.
pub struct NamespaceHandle {
    pub name: String,
    /// At most one in-progress mutation per namespace. Reads never take it.
    pub write_lock: Mutex<()>,
    /// Serializes flushes; distinct from the write lock so flushing does not
    /// block read admission.
    pub flush_lock: Mutex<()>,
    state: RwLock<NamespaceLogState>,
    headroom: Notify,
}

/// A batch captured for flushing. Events stay in the buffer until the flush
/// pipeline completes, so a failed flush retries from intact state.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    pub namespace: String,
    pub events: Vec<EventRecord>,
    pub first_seq: u64,
    pub last_seq: u64,
}

/// In-memory event log across namespaces, backed by the WAL.
pub struct EventLog {
    wal: WalStore,
    config: FlushConfig,
    handles: DashMap<String, Arc<NamespaceHandle>>,
    /// Wakes the background flusher when thresholds are crossed.
    flush_signal: Notify,
}

impl EventLog {
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, config: FlushConfig) -> Self {
        Self {
            wal: WalStore::new(backend),
            config,
            handles: DashMap::new(),
            flush_signal: Notify::new(),
        }
    }

    #[must_use]
    pub fn wal(&self) -> &WalStore {
        &self.wal
    }

    #[must_use]
    pub fn config(&self) -> &FlushConfig {
        &self.config
    }

    /// Handle for a namespace, created on first touch.
    pub fn handle(&self, namespace: &str) -> Arc<NamespaceHandle> {
        let key = namespace_path_segment(namespace);
        self.handles
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(NamespaceHandle {
                    name: key,
                    write_lock: Mutex::new(()),
                    flush_lock: Mutex::new(()),
                    state: RwLock::new(NamespaceLogState {
                        last_seq: 0,
                        buffer: Vec::new(),
                        buffer_bytes: 0,
                        last_flush_at: Instant::now(),
                    }),
                    headroom: Notify::new(),
                })
            })
            .clone()
    }

    /// Namespaces that have been touched.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        self.handles.iter().map(|e| e.key().clone()).collect()
    }

    /// Seed recovered state: the sequence counter never regresses below
    /// `last_seq`, and `tail` re-populates the unflushed buffer.
    pub async fn seed(&self, namespace: &str, last_seq: u64, tail: Vec<EventRecord>) {
        let handle = self.handle(namespace);
        let mut state = handle.state.write().await;
        state.last_seq = state.last_seq.max(last_seq);
        state.buffer_bytes = tail.iter().map(EventRecord::approximate_size).sum();
        state.buffer = tail;
    }

    /// Allocate `count` sequence numbers. The caller must hold the
    /// namespace's write lock; on epoch failure [`Self::restore_seq`] puts
    /// the counter back.
    pub async fn allocate_seqs(&self, namespace: &str, count: u64) -> (u64, u64) {
        let handle = self.handle(namespace);
        let mut state = handle.state.write().await;
        let first = state.last_seq + 1;
        state.last_seq += count;
        (first, state.last_seq)
    }

    /// Restore a namespace's sequence counter after a failed write epoch.
    pub async fn restore_seq(&self, namespace: &str, last_seq: u64) {
        let handle = self.handle(namespace);
        let mut state = handle.state.write().await;
        state.last_seq = last_seq;
    }

    /// Current sequence counter.
    pub async fn last_seq(&self, namespace: &str) -> u64 {
        self.handle(namespace).state.read().await.last_seq
    }

    /// Append committed events to the in-memory buffer and wake the flusher
    /// when thresholds are crossed.
    pub async fn append_committed(&self, namespace: &str, events: &[EventRecord]) {
        let handle = self.handle(namespace);
        let mut state = handle.state.write().await;
        state.buffer_bytes += events.iter().map(EventRecord::approximate_size).sum::<usize>();
        state.buffer.extend_from_slice(events);

        let over_threshold = state.buffer.len() >= self.config.flush_threshold
            || state.buffer_bytes >= self.config.byte_threshold;
        drop(state);
        if over_threshold {
            self.flush_signal.notify_one();
        }
    }

    /// Block while the namespace is over the unflushed hard limit.
    pub async fn wait_for_headroom(&self, namespace: &str) {
        let handle = self.handle(namespace);
        loop {
            let over = handle.state.read().await.buffer.len() >= self.config.hard_limit;
            if !over {
                return;
            }
            debug!(namespace, "backpressure: waiting for flush headroom");
            self.flush_signal.notify_one();
            // Timed wait so a notify racing the registration re-checks.
            let _ = tokio::time::timeout(
                Duration::from_millis(100),
                handle.headroom.notified(),
            )
            .await;
        }
    }

    /// Whether flush thresholds (entries, bytes, or age) are crossed.
    pub async fn should_flush(&self, namespace: &str) -> bool {
        let handle = self.handle(namespace);
        let state = handle.state.read().await;
        if state.buffer.is_empty() {
            return false;
        }
        state.buffer.len() >= self.config.flush_threshold
            || state.buffer_bytes >= self.config.byte_threshold
            || state.last_flush_at.elapsed() >= self.config.max_wait
    }

    /// Snapshot the buffer for flushing without draining it.
    pub async fn flush_snapshot(&self, namespace: &str) -> Option<FlushBatch> {
        let handle = self.handle(namespace);
        let state = handle.state.read().await;
        if state.buffer.is_empty() {
            return None;
        }
        Some(FlushBatch {
            namespace: handle.name.clone(),
            events: state.buffer.clone(),
            first_seq: state.buffer.first().map_or(0, |e| e.seq),
            last_seq: state.buffer.last().map_or(0, |e| e.seq),
        })
    }

    /// Drop buffered events covered by a completed flush and release
    /// backpressure waiters.
    pub async fn mark_flushed(&self, namespace: &str, through_seq: u64) {
        let handle = self.handle(namespace);
        let mut state = handle.state.write().await;
        let before = state.buffer.len();
        state.buffer.retain(|e| e.seq > through_seq);
        state.buffer_bytes = state.buffer.iter().map(EventRecord::approximate_size).sum();
        state.last_flush_at = Instant::now();
        let dropped = before - state.buffer.len();
        drop(state);
        if dropped > 0 {
            handle.headroom.notify_waiters();
        }
    }

    /// Wait until either the flush signal fires or `timeout` elapses.
    pub async fn flush_signal_or_tick(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.flush_signal.notified()).await;
    }

    /// Flush lag for one namespace.
    pub async fn flush_status(&self, namespace: &str) -> FlushStatus {
        let handle = self.handle(namespace);
        let state = handle.state.read().await;
        FlushStatus {
            namespace: handle.name.clone(),
            unflushed_count: state.buffer.len(),
            unflushed_bytes: state.buffer_bytes,
            last_seq: state.last_seq,
        }
    }

    /// Flush lag for every touched namespace.
    pub async fn flush_status_all(&self) -> Vec<FlushStatus> {
        let mut statuses = Vec::new();
        for namespace in self.namespaces() {
            statuses.push(self.flush_status(&namespace).await);
        }
        statuses.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        statuses
    }

    /// Buffered (unflushed) events targeting one entity, up to `max_seq`,
    /// in sequence order. Used by point-in-time reconstruction.
    pub async fn tail_for_entity(
        &self,
        namespace: &str,
        id: &EntityId,
        max_seq: u64,
    ) -> Vec<EventRecord> {
        let handle = self.handle(namespace);
        let state = handle.state.read().await;
        state
            .buffer
            .iter()
            .filter(|e| &e.target == id && e.seq <= max_seq)
            .cloned()
            .collect()
    }

    /// Clone of the full buffered tail for a namespace.
    pub async fn tail(&self, namespace: &str) -> Vec<EventRecord> {
        let handle = self.handle(namespace);
        let state = handle.state.read().await;
        state.buffer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entity, EventOp};
    use crate::storage::MemoryBackend;
    use chrono::Utc;
    use serde_json::Map;
    use ulid::Ulid;

    fn event(seq: u64) -> EventRecord {
        let entity = Entity::create(
            EntityId::new("posts", &format!("p{seq}")),
            "Post".into(),
            Map::new(),
            "t",
            Utc::now(),
        );
        EventRecord {
            id: Ulid::new(),
            ts: Utc::now(),
            seq,
            op: EventOp::Create,
            target: entity.id.clone(),
            before: None,
            after: Some(entity),
            actor: None,
            metadata: None,
            predicate: None,
            counterpart: None,
        }
    }

    fn log() -> EventLog {
        EventLog::new(Arc::new(MemoryBackend::new()), FlushConfig::default())
    }

    #[tokio::test]
    async fn test_sequence_allocation_is_dense() {
        let log = log();
        assert_eq!(log.allocate_seqs("posts", 3).await, (1, 3));
        assert_eq!(log.allocate_seqs("posts", 1).await, (4, 4));
        assert_eq!(log.allocate_seqs("users", 1).await, (1, 1));
    }

    #[tokio::test]
    async fn test_restore_seq_rolls_back_allocation() {
        let log = log();
        let (_, last) = log.allocate_seqs("posts", 2).await;
        assert_eq!(last, 2);
        log.restore_seq("posts", 0).await;
        assert_eq!(log.allocate_seqs("posts", 1).await, (1, 1));
    }

    #[tokio::test]
    async fn test_buffer_accounting_and_flush_status() {
        let log = log();
        log.append_committed("posts", &[event(1), event(2)]).await;

        let status = log.flush_status("posts").await;
        assert_eq!(status.unflushed_count, 2);
        assert!(status.unflushed_bytes > 0);

        log.mark_flushed("posts", 1).await;
        let status = log.flush_status("posts").await;
        assert_eq!(status.unflushed_count, 1);
    }

    #[tokio::test]
    async fn test_seed_never_regresses() {
        let log = log();
        log.seed("posts", 10, vec![]).await;
        log.seed("posts", 4, vec![]).await;
        assert_eq!(log.allocate_seqs("posts", 1).await, (11, 11));
    }

    #[tokio::test]
    async fn test_tail_for_entity_filters_and_orders() {
        let log = log();
        let mut e1 = event(1);
        let target = EntityId::new("posts", "pX");
        e1.target = target.clone();
        let mut e2 = event(2);
        e2.target = target.clone();
        let e3 = event(3);
        log.append_committed("posts", &[e1, e2, e3]).await;

        let tail = log.tail_for_entity("posts", &target, 1).await;
        assert_eq!(tail.len(), 1);
        let tail = log.tail_for_entity("posts", &target, 5).await;
        assert_eq!(tail.len(), 2);
    }
}
