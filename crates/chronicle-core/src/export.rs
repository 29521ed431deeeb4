//! Event export.
//!
//! Consumers observe the event stream two ways: an in-process push
//! subscription (broadcast channel) and cursor-based polling where the
//! cursor is the last observed event id. Delivery is at-least-once; events
//! are additionally appended to the `_events.parquet` archive at commit so
//! polls survive restarts and ring evictions.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::error::{ChronicleError, DbResult};
use crate::frame;
use crate::meta::EVENTS_PATH;
use crate::model::EventRecord;
use crate::storage::{StorageBackend, StorageError};

const EVENTS_MAGIC: [u8; 4] = *b"CHEV";
const BROADCAST_CAPACITY: usize = 1_024;

/// Event stream fan-out and archive.
pub struct EventExporter {
    backend: Arc<dyn StorageBackend>,
    ring_capacity: usize,
    ring: RwLock<VecDeque<EventRecord>>,
    sender: broadcast::Sender<EventRecord>,
}

impl EventExporter {
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, ring_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            backend,
            ring_capacity: ring_capacity.max(1),
            ring: RwLock::new(VecDeque::new()),
            sender,
        }
    }

    /// In-process push subscription. Slow consumers observe lag errors from
    /// the broadcast channel and can resume by cursor.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    /// Publish committed events: ring + push + durable archive append.
    ///
    /// # Errors
    ///
    /// Surfaces archive append failures (the commit itself is already
    /// durable in the WAL; the caller treats this as retryable).
    pub async fn publish(&self, events: &[EventRecord]) -> DbResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        {
            let mut ring = self.ring.write().await;
            for event in events {
                ring.push_back(event.clone());
                while ring.len() > self.ring_capacity {
                    ring.pop_front();
                }
            }
        }
        for event in events {
            // No receivers is fine.
            let _ = self.sender.send(event.clone());
        }

        let encoded: DbResult<Vec<Vec<u8>>> = events
            .iter()
            .map(|e| serde_json::to_vec(e).map_err(Into::into))
            .collect();
        let body = bincode::serialize(&encoded?)
            .map_err(|e| ChronicleError::internal(format!("event batch encode failed: {e}")))?;
        self.backend
            .append(EVENTS_PATH, &frame::encode(EVENTS_MAGIC, &body))
            .await?;
        Ok(())
    }

    /// Poll events after `cursor` (exclusive), oldest first, up to `limit`.
    /// Returns the records and the next cursor (the last id returned).
    ///
    /// # Errors
    ///
    /// Surfaces storage failures reading the archive.
    pub async fn events_since(
        &self,
        cursor: Option<Ulid>,
        limit: usize,
    ) -> DbResult<(Vec<EventRecord>, Option<Ulid>)> {
        let mut merged: Vec<EventRecord> = self.read_archive().await?;
        {
            let ring = self.ring.read().await;
            merged.extend(ring.iter().cloned());
        }
        merged.sort_by(|a, b| a.id.cmp(&b.id));
        merged.dedup_by(|a, b| a.id == b.id);

        let after = cursor.unwrap_or(Ulid::nil());
        let page: Vec<EventRecord> = merged
            .into_iter()
            .filter(|e| e.id > after)
            .take(limit)
            .collect();
        let next = page.last().map(|e| e.id);
        Ok((page, next))
    }

    async fn read_archive(&self) -> DbResult<Vec<EventRecord>> {
        let bytes = match self.backend.read(EVENTS_PATH).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for body in frame::decode_stream(EVENTS_MAGIC, &bytes) {
            let batch: Vec<Vec<u8>> = match bincode::deserialize(&body) {
                Ok(batch) => batch,
                Err(err) => {
                    warn!("skipping corrupt event archive batch: {err}");
                    continue;
                }
            };
            for raw in batch {
                match serde_json::from_slice::<EventRecord>(&raw) {
                    Ok(event) => events.push(event),
                    Err(err) => warn!("skipping corrupt archived event: {err}"),
                }
            }
        }
        Ok(events)
    }

    /// Drop in-memory state (facade disposal). The archive is durable.
    pub async fn clear(&self) {
        self.ring.write().await.clear();
    }
}
