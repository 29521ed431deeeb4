//! Startup recovery.
//!
//! Rebuilds engine state from the backend:
//!
//! - pending row groups recorded in the pending table are promoted
//!   (idempotent), and unrecorded pending files are promoted only when the
//!   WAL still covers their sequence range, otherwise discarded
//! - per-namespace sequence counters are initialized from the maximum
//!   `last_seq` observed across WAL entries, pending groups, and published
//!   row groups, so counters never regress
//! - the unflushed tail is re-read from the WAL so queries and the next
//!   flush see the same events as before the restart

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::DbResult;
use crate::meta::{MetaStore, PendingGroupRef, PendingRecord};
use crate::model::EventRecord;
use crate::router::Router;
use crate::rowgroup::io;
use crate::storage::StorageBackend;

use super::flush::Flusher;
use super::EventLog;

/// Per-namespace recovery summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRecovery {
    pub namespace: String,
    pub last_seq: u64,
    pub replayed_events: usize,
}

/// Overall recovery summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub promoted_pending: usize,
    pub discarded_pending: usize,
    pub namespaces: Vec<NamespaceRecovery>,
}

/// Run recovery. Returns the report and the recovered unflushed tail per
/// namespace, which the facade replays into the entity store and indexes.
///
/// # Errors
///
/// Surfaces storage failures; recovery is idempotent and can be re-run.
#[instrument(level = "debug", skip_all)]
pub async fn recover(
    backend: &Arc<dyn StorageBackend>,
    log: &EventLog,
    flusher: &Flusher,
    meta: &MetaStore,
    router: &Router,
) -> DbResult<(RecoveryReport, BTreeMap<String, Vec<EventRecord>>)> {
    let mut report = RecoveryReport::default();

    // Recorded pending groups were durably promoted at flush step 3;
    // re-running promotion is idempotent on group ids.
    let table = meta.load_meta().await?;
    for record in &table.pending {
        flusher.promote(record).await?;
        report.promoted_pending += 1;
    }

    let namespaces = discover_namespaces(backend, router).await?;

    // Unrecorded pending files: promote if the WAL still covers their range,
    // discard otherwise (a torn flush that never reached the pending table).
    for namespace in &namespaces {
        report = sweep_unrecorded_pending(backend, log, flusher, router, namespace, report).await?;
    }

    // Sequence counters and unflushed tails.
    let mut tails = BTreeMap::new();
    for namespace in &namespaces {
        let entries = log.wal().list(namespace).await?;
        let mut tail: Vec<EventRecord> = Vec::new();
        for entry in &entries {
            tail.extend(log.wal().read(entry).await?);
        }
        tail.sort_by_key(|e| e.seq);

        let wal_max = entries.iter().map(|e| e.last_seq).max().unwrap_or(0);
        let published_max = published_last_seq(backend, router, namespace).await?;
        let last_seq = wal_max.max(published_max);

        log.seed(namespace, last_seq, tail.clone()).await;
        report.namespaces.push(NamespaceRecovery {
            namespace: namespace.clone(),
            last_seq,
            replayed_events: tail.len(),
        });
        tails.insert(namespace.clone(), tail);
    }

    info!(
        promoted = report.promoted_pending,
        discarded = report.discarded_pending,
        namespaces = report.namespaces.len(),
        "✅ recovery complete"
    );
    Ok((report, tails))
}

async fn sweep_unrecorded_pending(
    backend: &Arc<dyn StorageBackend>,
    log: &EventLog,
    flusher: &Flusher,
    router: &Router,
    namespace: &str,
    mut report: RecoveryReport,
) -> DbResult<RecoveryReport> {
    let pending_dir = format!("{namespace}/_pending/");
    for object in backend.list(&pending_dir).await? {
        let Some(file) = io::load_file(backend, &object.path).await? else { continue };
        let (first, last) = (
            file.metas().iter().map(|m| m.first_seq).min().unwrap_or(0),
            file.metas().iter().map(|m| m.last_seq).max().unwrap_or(0),
        );

        if first == 0 || !log.wal().covers(namespace, first, last).await? {
            warn!(path = %object.path, "discarding uncovered pending row group");
            backend.delete(&object.path).await?;
            report.discarded_pending += 1;
            continue;
        }

        // Re-derive target paths from the rows themselves, then promote.
        let mut groups = Vec::with_capacity(file.group_count());
        for (ordinal, group_meta) in file.metas().iter().enumerate() {
            let group = file.decode_group(ordinal)?;
            let entities = group.entities()?;
            // Group ordinals must stay aligned with the file, so even an
            // empty group keeps its slot (targeting the base path).
            let target_path = match entities.first() {
                Some(first_entity) => router.path_for_entity(namespace, first_entity).await,
                None => router.base_path(namespace).await,
            };
            groups.push(PendingGroupRef {
                group_id: group_meta.group_id.clone(),
                target_path,
            });
        }
        let id = object
            .path
            .rsplit('/')
            .next()
            .and_then(|n| n.strip_suffix(".parquet"))
            .unwrap_or("recovered")
            .to_string();
        let record = PendingRecord {
            id,
            namespace: namespace.to_string(),
            pending_path: object.path.clone(),
            first_seq: first,
            last_seq: last,
            groups,
        };
        flusher.promote(&record).await?;
        report.promoted_pending += 1;
    }
    Ok(report)
}

/// Highest event sequence recorded in published row groups.
async fn published_last_seq(
    backend: &Arc<dyn StorageBackend>,
    router: &Router,
    namespace: &str,
) -> DbResult<u64> {
    let mut paths: BTreeSet<String> = router
        .resolve_data_paths(namespace, None)
        .await
        .into_iter()
        .collect();
    paths.insert(router.base_path(namespace).await);
    for object in backend.list(&format!("{namespace}/_shards/")).await? {
        paths.insert(object.path);
    }

    let mut max_seq = 0;
    for path in paths {
        if let Some(file) = io::load_file(backend, &path).await? {
            max_seq = max_seq.max(file.last_seq());
        }
    }
    Ok(max_seq)
}

/// Namespaces visible on the backend or registered in the router.
async fn discover_namespaces(
    backend: &Arc<dyn StorageBackend>,
    router: &Router,
) -> DbResult<BTreeSet<String>> {
    let mut namespaces: BTreeSet<String> = router
        .specs()
        .await
        .into_iter()
        .map(|s| crate::model::namespace_path_segment(&s.name))
        .collect();

    for object in backend.list("").await? {
        let mut segments = object.path.split('/');
        match (segments.next(), segments.next()) {
            (Some("data"), Some(second)) => {
                let ns = second.strip_suffix(".parquet").unwrap_or(second);
                if !ns.is_empty() && !ns.starts_with('_') {
                    namespaces.insert(ns.to_string());
                }
            }
            (Some(first), Some("_wal" | "_pending" | "_shards")) if !first.starts_with('_') => {
                namespaces.insert(first.to_string());
            }
            _ => {}
        }
    }
    Ok(namespaces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{RowGroupCache, RowGroupCacheConfig};
    use crate::event::FlushConfig;
    use crate::model::{Entity, EntityId, EventOp};
    use crate::router::RouterConfig;
    use crate::rowgroup::{DataFile, RowGroup};
    use crate::storage::MemoryBackend;
    use chrono::Utc;
    use serde_json::{json, Map};
    use ulid::Ulid;

    fn create_event(seq: u64, local: &str) -> EventRecord {
        let mut data = Map::new();
        data.insert("name".into(), json!(format!("n{seq}")));
        let entity = Entity::create(
            EntityId::new("posts", local),
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

    struct Fixture {
        backend: Arc<dyn StorageBackend>,
        log: Arc<EventLog>,
        router: Arc<Router>,
        meta: Arc<MetaStore>,
        flusher: Arc<Flusher>,
    }

    fn fixture() -> Fixture {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let log = Arc::new(EventLog::new(Arc::clone(&backend), FlushConfig::default()));
        let router = Arc::new(Router::new(RouterConfig::default()));
        let cache = Arc::new(RowGroupCache::new(RowGroupCacheConfig::default()));
        let meta = Arc::new(MetaStore::new(Arc::clone(&backend)));
        let flusher = Arc::new(Flusher::new(
            Arc::clone(&backend),
            Arc::clone(&log),
            Arc::clone(&router),
            cache,
            Arc::clone(&meta),
        ));
        Fixture { backend, log, router, meta, flusher }
    }

    #[tokio::test]
    async fn test_recovers_tail_and_sequence_counter() {
        let f = fixture();
        let events = vec![create_event(1, "p1"), create_event(2, "p2")];
        f.log.wal().append("posts", &events).await.unwrap();

        let (report, tails) = recover(&f.backend, &f.log, &f.flusher, &f.meta, &f.router)
            .await
            .unwrap();
        assert_eq!(report.namespaces.len(), 1);
        assert_eq!(report.namespaces[0].last_seq, 2);
        assert_eq!(tails.get("posts").unwrap().len(), 2);
        assert_eq!(f.log.allocate_seqs("posts", 1).await, (3, 3));
    }

    #[tokio::test]
    async fn test_promotes_covered_unrecorded_pending() {
        let f = fixture();
        // Crash scenario: WAL and pending file written, table record missing.
        let events = vec![create_event(1, "p1")];
        f.log.wal().append("posts", &events).await.unwrap();

        let entity = events[0].after.clone().unwrap();
        let mut file = DataFile::empty();
        file.append_group(RowGroup::from_entities("orphan-0".into(), 1, 1, &[entity]))
            .unwrap();
        f.backend
            .write_atomic("posts/_pending/orphan.parquet", &file.encode().unwrap())
            .await
            .unwrap();

        let (report, _) = recover(&f.backend, &f.log, &f.flusher, &f.meta, &f.router)
            .await
            .unwrap();
        assert_eq!(report.promoted_pending, 1);
        assert_eq!(report.discarded_pending, 0);

        let published = io::load_file(&f.backend, "data/posts/data.parquet")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(published.total_rows(), 1);
        assert!(f.backend.list("posts/_pending/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discards_uncovered_pending() {
        let f = fixture();
        // Pending file exists but its WAL range was never written (or was
        // already truncated without a table record): must be discarded.
        let entity = create_event(7, "p7").after.clone().unwrap();
        let mut file = DataFile::empty();
        file.append_group(RowGroup::from_entities("stray-0".into(), 7, 7, &[entity]))
            .unwrap();
        f.backend
            .write_atomic("posts/_pending/stray.parquet", &file.encode().unwrap())
            .await
            .unwrap();

        let (report, _) = recover(&f.backend, &f.log, &f.flusher, &f.meta, &f.router)
            .await
            .unwrap();
        assert_eq!(report.promoted_pending, 0);
        assert_eq!(report.discarded_pending, 1);
        assert!(io::load_file(&f.backend, "data/posts/data.parquet").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recorded_pending_is_promoted_even_after_wal_truncation() {
        let f = fixture();
        // Crash between flush steps 4 and 5: WAL truncated, record present.
        let entity = create_event(1, "p1").after.clone().unwrap();
        let mut file = DataFile::empty();
        file.append_group(RowGroup::from_entities("rec-0".into(), 1, 1, &[entity]))
            .unwrap();
        f.backend
            .write_atomic("posts/_pending/rec.parquet", &file.encode().unwrap())
            .await
            .unwrap();
        f.meta
            .record_pending(PendingRecord {
                id: "rec".into(),
                namespace: "posts".into(),
                pending_path: "posts/_pending/rec.parquet".into(),
                first_seq: 1,
                last_seq: 1,
                groups: vec![PendingGroupRef {
                    group_id: "rec-0".into(),
                    target_path: "data/posts/data.parquet".into(),
                }],
            })
            .await
            .unwrap();

        let (report, _) = recover(&f.backend, &f.log, &f.flusher, &f.meta, &f.router)
            .await
            .unwrap();
        assert_eq!(report.promoted_pending, 1);

        let published = io::load_file(&f.backend, "data/posts/data.parquet")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(published.total_rows(), 1);
        // Sequence counter reflects the published group.
        assert_eq!(f.log.allocate_seqs("posts", 1).await, (2, 2));
    }

    #[tokio::test]
    async fn test_recovery_is_idempotent() {
        let f = fixture();
        let events = vec![create_event(1, "p1")];
        f.log.wal().append("posts", &events).await.unwrap();

        let (first, _) = recover(&f.backend, &f.log, &f.flusher, &f.meta, &f.router)
            .await
            .unwrap();
        let (second, _) = recover(&f.backend, &f.log, &f.flusher, &f.meta, &f.router)
            .await
            .unwrap();
        assert_eq!(first.namespaces, second.namespaces);
    }
}
