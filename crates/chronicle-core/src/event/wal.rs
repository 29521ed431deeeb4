//! Per-namespace write-ahead log.
//!
//! Each accepted write batch becomes one WAL entry: a checksummed segment
//! file at `<ns>/_wal/<first>-<last>` covering a contiguous sequence range.
//! Zero-padded sequence numbers in the file name keep listings ordered, so
//! truncation can walk entries in order without reading them.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{ChronicleError, DbResult};
use crate::frame;
use crate::model::{namespace_path_segment, EventRecord};
use crate::storage::StorageBackend;

const WAL_MAGIC: [u8; 4] = *b"CHWL";

/// Descriptor of one WAL entry (a contiguous event range).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntryMeta {
    pub path: String,
    pub namespace: String,
    pub first_seq: u64,
    pub last_seq: u64,
}

#[derive(Serialize, Deserialize)]
struct WalSegment {
    namespace: String,
    first_seq: u64,
    last_seq: u64,
    /// JSON-encoded [`EventRecord`]s; JSON because open payloads are not
    /// bincode-representable.
    events: Vec<Vec<u8>>,
}

/// Durable WAL over a storage backend.
pub struct WalStore {
    backend: Arc<dyn StorageBackend>,
}

impl WalStore {
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn dir(namespace: &str) -> String {
        format!("{}/_wal/", namespace_path_segment(namespace))
    }

    fn entry_path(namespace: &str, first_seq: u64, last_seq: u64) -> String {
        format!("{}{first_seq:020}-{last_seq:020}", Self::dir(namespace))
    }

    fn parse_entry_path(namespace: &str, path: &str) -> Option<WalEntryMeta> {
        let name = path.rsplit('/').next()?;
        let (first, last) = name.split_once('-')?;
        Some(WalEntryMeta {
            path: path.to_string(),
            namespace: namespace.to_string(),
            first_seq: first.parse().ok()?,
            last_seq: last.parse().ok()?,
        })
    }

    /// Append one entry covering `events` (already sequence-ordered).
    ///
    /// # Errors
    ///
    /// Fails when the events cannot be encoded or the write fails; nothing is
    /// partially visible because segments are written atomically.
    #[instrument(level = "debug", skip(self, events), fields(namespace = %namespace))]
    pub async fn append(&self, namespace: &str, events: &[EventRecord]) -> DbResult<WalEntryMeta> {
        let first_seq = events.first().map_or(0, |e| e.seq);
        let last_seq = events.last().map_or(0, |e| e.seq);
        if events.is_empty() || first_seq > last_seq {
            return Err(ChronicleError::internal("empty or unordered WAL batch"));
        }

        let encoded: DbResult<Vec<Vec<u8>>> = events
            .iter()
            .map(|e| serde_json::to_vec(e).map_err(Into::into))
            .collect();
        let segment = WalSegment {
            namespace: namespace.to_string(),
            first_seq,
            last_seq,
            events: encoded?,
        };
        let body = bincode::serialize(&segment)
            .map_err(|e| ChronicleError::internal(format!("WAL encode failed: {e}")))?;

        let path = Self::entry_path(namespace, first_seq, last_seq);
        self.backend.write_atomic(&path, &frame::encode(WAL_MAGIC, &body)).await?;
        debug!(path, first_seq, last_seq, "WAL entry appended");

        Ok(WalEntryMeta {
            path,
            namespace: namespace.to_string(),
            first_seq,
            last_seq,
        })
    }

    /// List entries for a namespace, ordered by sequence range.
    ///
    /// # Errors
    ///
    /// Fails when the listing fails.
    pub async fn list(&self, namespace: &str) -> DbResult<Vec<WalEntryMeta>> {
        let listed = self.backend.list(&Self::dir(namespace)).await?;
        let mut entries: Vec<WalEntryMeta> = listed
            .iter()
            .filter_map(|meta| Self::parse_entry_path(namespace, &meta.path))
            .collect();
        entries.sort_by_key(|e| e.first_seq);
        Ok(entries)
    }

    /// Read the events of one entry, verifying checksums.
    ///
    /// # Errors
    ///
    /// Fails on missing or corrupt segments.
    pub async fn read(&self, entry: &WalEntryMeta) -> DbResult<Vec<EventRecord>> {
        let bytes = self.backend.read(&entry.path).await?;
        let body = frame::decode(WAL_MAGIC, &bytes)?;
        let segment: WalSegment = bincode::deserialize(&body)
            .map_err(|e| ChronicleError::internal(format!("WAL decode failed: {e}")))?;
        segment
            .events
            .iter()
            .map(|raw| {
                serde_json::from_slice(raw)
                    .map_err(|e| ChronicleError::internal(format!("WAL event decode failed: {e}")))
            })
            .collect()
    }

    /// Remove one entry (epoch rollback removes just-inserted rows).
    ///
    /// # Errors
    ///
    /// Fails when the delete fails.
    pub async fn remove(&self, entry: &WalEntryMeta) -> DbResult<()> {
        self.backend.delete(&entry.path).await?;
        Ok(())
    }

    /// Delete entries fully covered by `through_seq`, in order, stopping at
    /// the first entry that extends past it. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Fails when listing or deletion fails.
    #[instrument(level = "debug", skip(self), fields(namespace = %namespace))]
    pub async fn truncate_through(&self, namespace: &str, through_seq: u64) -> DbResult<usize> {
        let entries = self.list(namespace).await?;
        let mut removed = 0;
        for entry in entries {
            if entry.last_seq > through_seq {
                break;
            }
            self.backend.delete(&entry.path).await?;
            removed += 1;
        }
        if removed > 0 {
            debug!(namespace, through_seq, removed, "WAL truncated");
        }
        Ok(removed)
    }

    /// Highest sequence number present in the WAL for a namespace.
    ///
    /// # Errors
    ///
    /// Fails when listing fails.
    pub async fn max_seq(&self, namespace: &str) -> DbResult<u64> {
        Ok(self
            .list(namespace)
            .await?
            .iter()
            .map(|e| e.last_seq)
            .max()
            .unwrap_or(0))
    }

    /// Whether the WAL still covers every sequence in `[first, last]`.
    ///
    /// # Errors
    ///
    /// Fails when listing fails.
    pub async fn covers(&self, namespace: &str, first: u64, last: u64) -> DbResult<bool> {
        let entries = self.list(namespace).await?;
        let mut next_needed = first;
        for entry in &entries {
            if entry.last_seq < next_needed {
                continue;
            }
            if entry.first_seq > next_needed {
                return Ok(false);
            }
            next_needed = entry.last_seq + 1;
            if next_needed > last {
                return Ok(true);
            }
        }
        Ok(next_needed > last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entity, EntityId, EventOp};
    use crate::storage::MemoryBackend;
    use chrono::Utc;
    use serde_json::{json, Map};
    use ulid::Ulid;

    fn event(seq: u64) -> EventRecord {
        let mut data = Map::new();
        data.insert("n".into(), json!(seq));
        let entity = Entity::create(
            EntityId::new("posts", &format!("p{seq}")),
            "Post".into(),
            data,
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

    fn store() -> WalStore {
        WalStore::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_append_read_round_trip() {
        let wal = store();
        let events = vec![event(1), event(2), event(3)];
        let entry = wal.append("posts", &events).await.unwrap();
        assert_eq!((entry.first_seq, entry.last_seq), (1, 3));

        let read = wal.read(&entry).await.unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read[2].seq, 3);
    }

    #[tokio::test]
    async fn test_list_is_sequence_ordered() {
        let wal = store();
        wal.append("posts", &[event(4), event(5)]).await.unwrap();
        wal.append("posts", &[event(1), event(2), event(3)]).await.unwrap();

        let entries = wal.list("posts").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].first_seq, 1);
        assert_eq!(entries[1].first_seq, 4);
        assert_eq!(wal.max_seq("posts").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_truncation_is_ordered_and_bounded() {
        let wal = store();
        wal.append("posts", &[event(1), event(2)]).await.unwrap();
        wal.append("posts", &[event(3), event(4)]).await.unwrap();
        wal.append("posts", &[event(5)]).await.unwrap();

        // Covers only the first entry; the second extends past 3.
        assert_eq!(wal.truncate_through("posts", 3).await.unwrap(), 1);
        let entries = wal.list("posts").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].first_seq, 3);

        assert_eq!(wal.truncate_through("posts", 5).await.unwrap(), 2);
        assert!(wal.list("posts").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_coverage_checks() {
        let wal = store();
        wal.append("posts", &[event(1), event(2)]).await.unwrap();
        wal.append("posts", &[event(3)]).await.unwrap();

        assert!(wal.covers("posts", 1, 3).await.unwrap());
        assert!(wal.covers("posts", 2, 3).await.unwrap());
        assert!(!wal.covers("posts", 1, 4).await.unwrap());

        wal.truncate_through("posts", 2).await.unwrap();
        assert!(!wal.covers("posts", 1, 3).await.unwrap());
        assert!(wal.covers("posts", 3, 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let wal = store();
        wal.append("posts", &[event(1)]).await.unwrap();
        wal.append("users", &[event(1)]).await.unwrap();

        assert_eq!(wal.list("posts").await.unwrap().len(), 1);
        assert_eq!(wal.list("users").await.unwrap().len(), 1);
        wal.truncate_through("posts", 10).await.unwrap();
        assert_eq!(wal.list("users").await.unwrap().len(), 1);
    }
}
