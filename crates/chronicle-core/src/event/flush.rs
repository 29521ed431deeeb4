//! The batch-flush pipeline.
//!
//! Promotes buffered events into durable columnar row groups:
//!
//! 1. snapshot the namespace buffer (events stay in place until step 5)
//! 2. fold events into final per-entity rows, split them by shard path, and
//!    atomically write one pending row-group file
//! 3. record the promotion in the pending table (`_meta.parquet`)
//! 4. truncate WAL entries whose range is covered
//! 5. merge each group into its published data file (idempotent on group id),
//!    drop the pending record and file, and release the buffer
//!
//! A crash between steps 2 and 5 is safe: recovery promotes pending files
//! that are recorded or still WAL-covered and discards the rest. A flush
//! failure leaves WAL and buffer intact; the next cycle retries.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

use crate::cache::RowGroupCache;
use crate::error::DbResult;
use crate::meta::{MetaStore, PendingGroupRef, PendingRecord};
use crate::model::{Entity, EntityId, EventRecord};
use crate::router::Router;
use crate::rowgroup::{io, DataFile, RowGroup};
use crate::storage::StorageBackend;

use super::{EventLog, FlushBatch};

/// Result of one completed flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    pub namespace: String,
    pub flushed_events: usize,
    pub row_groups_written: usize,
    pub last_seq: u64,
}

/// Executes flushes, either on demand or as a background task.
pub struct Flusher {
    backend: Arc<dyn StorageBackend>,
    log: Arc<EventLog>,
    router: Arc<Router>,
    cache: Arc<RowGroupCache>,
    meta: Arc<MetaStore>,
}

impl Flusher {
    #[must_use]
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        log: Arc<EventLog>,
        router: Arc<Router>,
        cache: Arc<RowGroupCache>,
        meta: Arc<MetaStore>,
    ) -> Self {
        Self {
            backend,
            log,
            router,
            cache,
            meta,
        }
    }

    /// Flush one namespace if it has buffered events.
    ///
    /// # Errors
    ///
    /// Surfaces storage failures; the WAL and buffer are left intact so the
    /// next flush retries.
    #[instrument(level = "debug", skip(self), fields(namespace = %namespace))]
    pub async fn flush_namespace(&self, namespace: &str) -> DbResult<Option<FlushOutcome>> {
        let handle = self.log.handle(namespace);
        let _flush_guard = handle.flush_lock.lock().await;

        let Some(batch) = self.log.flush_snapshot(namespace).await else {
            return Ok(None);
        };
        debug!(
            events = batch.events.len(),
            first_seq = batch.first_seq,
            last_seq = batch.last_seq,
            "🔄 flushing"
        );

        // Steps 2-3: pending file + pending table record.
        let record = self.write_pending(&batch).await?;
        let row_groups = record.groups.len();

        // Step 4: drop WAL entries fully covered by this flush.
        self.log.wal().truncate_through(&batch.namespace, batch.last_seq).await?;

        // Step 5: merge into the published set and clean up.
        self.promote(&record).await?;
        self.log.mark_flushed(&batch.namespace, batch.last_seq).await;

        info!(
            namespace = %batch.namespace,
            events = batch.events.len(),
            row_groups,
            last_seq = batch.last_seq,
            "✅ flush complete"
        );
        Ok(Some(FlushOutcome {
            namespace: batch.namespace.clone(),
            flushed_events: batch.events.len(),
            row_groups_written: row_groups,
            last_seq: batch.last_seq,
        }))
    }

    /// Fold the batch into per-entity rows, write the pending file, and
    /// record it in the pending table.
    async fn write_pending(&self, batch: &FlushBatch) -> DbResult<PendingRecord> {
        let rows = fold_final_snapshots(&batch.events);

        // Split rows by their shard path.
        let mut by_path: BTreeMap<String, Vec<Entity>> = BTreeMap::new();
        for entity in rows.into_values() {
            let path = self.router.path_for_entity(&batch.namespace, &entity).await;
            by_path.entry(path).or_default().push(entity);
        }

        let id = Ulid::new().to_string();
        let pending_path = format!("{}/_pending/{}.parquet", batch.namespace, id.to_lowercase());

        let mut file = DataFile::empty();
        let mut groups = Vec::with_capacity(by_path.len());
        for (ordinal, (target_path, entities)) in by_path.iter().enumerate() {
            let group_id = format!("{id}-{ordinal}");
            file.append_group(RowGroup::from_entities(
                group_id.clone(),
                batch.first_seq,
                batch.last_seq,
                entities,
            ))?;
            groups.push(PendingGroupRef {
                group_id,
                target_path: target_path.clone(),
            });
        }

        self.backend.write_atomic(&pending_path, &file.encode()?).await?;

        let record = PendingRecord {
            id,
            namespace: batch.namespace.clone(),
            pending_path,
            first_seq: batch.first_seq,
            last_seq: batch.last_seq,
            groups,
        };
        self.meta.record_pending(record.clone()).await?;
        Ok(record)
    }

    /// Merge a pending file's groups into their published data files. Safe
    /// to re-run: committed groups are recognized by id and skipped.
    pub(crate) async fn promote(&self, record: &PendingRecord) -> DbResult<()> {
        let pending = io::load_file(&self.backend, &record.pending_path).await?;
        let Some(pending) = pending else {
            // Already cleaned up by a previous promotion.
            self.meta.remove_pending(&record.id).await?;
            return Ok(());
        };

        for (ordinal, group_ref) in record.groups.iter().enumerate() {
            let mut target = io::load_file(&self.backend, &group_ref.target_path)
                .await?
                .unwrap_or_else(DataFile::empty);
            if target.contains_group(&group_ref.group_id) {
                continue;
            }
            let group = pending.decode_group(ordinal)?;
            target.append_group(group)?;
            io::save_file(&self.backend, &group_ref.target_path, &target).await?;
            self.cache.invalidate_file(&group_ref.target_path).await;
            self.observe_shard_from_path(&record.namespace, &group_ref.target_path).await;
        }

        self.meta.remove_pending(&record.id).await?;
        if let Err(err) = self.backend.delete(&record.pending_path).await {
            warn!(path = %record.pending_path, "pending file cleanup failed: {err}");
        }
        Ok(())
    }

    /// Re-learn a shard value from a promoted path (recovery path).
    async fn observe_shard_from_path(&self, namespace: &str, path: &str) {
        let Some(shard_segment) = path.split('/').find(|s| s.contains('=')) else { return };
        if let Some((_, value)) = shard_segment.split_once('=') {
            self.router.observe_shard(namespace, value).await;
        }
    }

    /// Flush every namespace that crossed its thresholds.
    pub async fn flush_due(&self) {
        for namespace in self.log.namespaces() {
            if self.log.should_flush(&namespace).await {
                if let Err(err) = self.flush_namespace(&namespace).await {
                    warn!(namespace, "flush failed, will retry: {err}");
                }
            }
        }
    }

    /// Force-flush one namespace or all of them.
    ///
    /// # Errors
    ///
    /// Surfaces the first flush failure.
    pub async fn flush_all(&self, namespace: Option<&str>) -> DbResult<Vec<FlushOutcome>> {
        let namespaces = match namespace {
            Some(ns) => vec![crate::model::namespace_path_segment(ns)],
            None => self.log.namespaces(),
        };
        let mut outcomes = Vec::new();
        for ns in namespaces {
            if let Some(outcome) = self.flush_namespace(&ns).await? {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    /// Background flush loop: wakes on threshold signals or the tick
    /// interval, exits on cancellation.
    pub async fn run_background(self: Arc<Self>, cancel: CancellationToken) {
        let interval = self.log.config().interval;
        info!("background flusher started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.log.flush_signal_or_tick(interval) => {
                    self.flush_due().await;
                }
            }
        }
        info!("background flusher stopped");
    }
}

/// Fold an event batch into the final post-batch snapshot per entity.
/// Link/Unlink events carry no payload snapshots and do not produce rows.
fn fold_final_snapshots(events: &[EventRecord]) -> BTreeMap<EntityId, Entity> {
    let mut snapshots: BTreeMap<EntityId, Entity> = BTreeMap::new();
    for event in events {
        let prior = snapshots.get(&event.target).cloned();
        if let Some(next) = event.apply(prior) {
            snapshots.insert(event.target.clone(), next);
        }
    }
    snapshots
}
