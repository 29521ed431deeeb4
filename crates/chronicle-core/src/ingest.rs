//! Streaming ingestion.
//!
//! Batches an asynchronous sequence of input records, applies an optional
//! transform (which may skip records), and hands each full batch to the
//! caller's writer. Progress is reported through callback hooks. Under
//! `ordered = true` input order is preserved, and a partial batch already
//! accumulated is flushed before an item error surfaces; the error names how
//! many records were committed.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::debug;

use crate::error::{ChronicleError, DbResult};

/// Ingestion tuning
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub batch_size: usize,
    /// Preserve input order (best-effort otherwise).
    pub ordered: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            ordered: true,
        }
    }
}

/// Transform outcome: keep a (possibly rewritten) record or skip it.
pub enum TransformOutcome {
    Keep(Value),
    Skip,
}

/// Optional per-record transform.
pub type Transform = Arc<dyn Fn(Value) -> TransformOutcome + Send + Sync>;

/// Completion report for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub batch_index: usize,
    pub batch_size: usize,
    pub total_processed: usize,
}

/// Callback hooks. Hook panics are not caught, but hook errors do not exist
/// by construction (they are `Fn`, not fallible).
#[derive(Clone, Default)]
pub struct IngestHooks {
    pub on_batch_complete: Option<Arc<dyn Fn(BatchReport) + Send + Sync>>,
    pub on_progress: Option<Arc<dyn Fn(usize) + Send + Sync>>,
}

/// Final ingestion report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub processed: usize,
    pub skipped: usize,
    pub batches: usize,
}

/// Drive a record stream through batching and the caller's writer.
///
/// `write_batch` persists one batch through the normal mutation path and
/// returns how many records it committed.
///
/// # Errors
///
/// Surfaces the first item or write error. With `ordered = true`, the
/// partial batch accumulated before a failing item is flushed first.
pub async fn run<S, F, Fut>(
    mut records: S,
    config: &IngestConfig,
    transform: Option<&Transform>,
    hooks: &IngestHooks,
    mut write_batch: F,
) -> DbResult<IngestReport>
where
    S: Stream<Item = DbResult<Value>> + Unpin,
    F: FnMut(Vec<Value>) -> Fut,
    Fut: std::future::Future<Output = DbResult<usize>>,
{
    let batch_size = config.batch_size.max(1);
    let mut report = IngestReport::default();
    let mut batch: Vec<Value> = Vec::with_capacity(batch_size);

    loop {
        let item = records.next().await;
        match item {
            Some(Ok(record)) => {
                let record = match transform {
                    Some(f) => match f(record) {
                        TransformOutcome::Keep(v) => v,
                        TransformOutcome::Skip => {
                            report.skipped += 1;
                            continue;
                        }
                    },
                    None => record,
                };
                batch.push(record);
                if batch.len() >= batch_size {
                    flush_batch(&mut batch, &mut report, hooks, &mut write_batch).await?;
                }
            }
            Some(Err(err)) => {
                // Contract: the accumulated partial batch commits before the
                // error surfaces.
                if config.ordered && !batch.is_empty() {
                    flush_batch(&mut batch, &mut report, hooks, &mut write_batch).await?;
                }
                return Err(ChronicleError::validation(format!(
                    "ingest aborted after {} committed records: {err}",
                    report.processed
                )));
            }
            None => break,
        }
    }

    if !batch.is_empty() {
        flush_batch(&mut batch, &mut report, hooks, &mut write_batch).await?;
    }
    debug!(
        processed = report.processed,
        skipped = report.skipped,
        batches = report.batches,
        "ingest stream complete"
    );
    Ok(report)
}

async fn flush_batch<F, Fut>(
    batch: &mut Vec<Value>,
    report: &mut IngestReport,
    hooks: &IngestHooks,
    write_batch: &mut F,
) -> DbResult<()>
where
    F: FnMut(Vec<Value>) -> Fut,
    Fut: std::future::Future<Output = DbResult<usize>>,
{
    let size = batch.len();
    let written = write_batch(std::mem::take(batch)).await?;
    report.processed += written;
    report.batches += 1;

    if let Some(on_progress) = &hooks.on_progress {
        on_progress(report.processed);
    }
    if let Some(on_batch_complete) = &hooks.on_batch_complete {
        on_batch_complete(BatchReport {
            batch_index: report.batches - 1,
            batch_size: size,
            total_processed: report.processed,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn records(n: usize) -> impl Stream<Item = DbResult<Value>> + Unpin {
        futures::stream::iter((0..n).map(|i| Ok(serde_json::json!({"n": i}))))
    }

    #[tokio::test]
    async fn test_batch_sizes_and_totals() {
        let config = IngestConfig {
            batch_size: 10,
            ordered: true,
        };
        let reports: Arc<Mutex<Vec<BatchReport>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let hooks = IngestHooks {
            on_batch_complete: Some(Arc::new(move |r| sink.lock().unwrap().push(r))),
            on_progress: None,
        };

        let report = run(records(25), &config, None, &hooks, |batch| async move {
            Ok(batch.len())
        })
        .await
        .unwrap();

        assert_eq!(report.processed, 25);
        assert_eq!(report.batches, 3);
        let reports = reports.lock().unwrap();
        let sizes: Vec<usize> = reports.iter().map(|r| r.batch_size).collect();
        let totals: Vec<usize> = reports.iter().map(|r| r.total_processed).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(totals, vec![10, 20, 25]);
    }

    #[tokio::test]
    async fn test_transform_skips_records() {
        let config = IngestConfig::default();
        let transform: Transform = Arc::new(|v| {
            if v["n"].as_u64().is_some_and(|n| n % 2 == 0) {
                TransformOutcome::Keep(v)
            } else {
                TransformOutcome::Skip
            }
        });

        let report = run(
            records(10),
            &config,
            Some(&transform),
            &IngestHooks::default(),
            |batch| async move { Ok(batch.len()) },
        )
        .await
        .unwrap();

        assert_eq!(report.processed, 5);
        assert_eq!(report.skipped, 5);
    }

    #[tokio::test]
    async fn test_ordered_error_flushes_partial_batch() {
        let config = IngestConfig {
            batch_size: 10,
            ordered: true,
        };
        let stream = futures::stream::iter(vec![
            Ok(serde_json::json!({"n": 0})),
            Ok(serde_json::json!({"n": 1})),
            Err(ChronicleError::validation("bad record")),
            Ok(serde_json::json!({"n": 3})),
        ]);

        let written: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&written);
        let err = run(stream, &config, None, &IngestHooks::default(), move |batch| {
            let sink = Arc::clone(&sink);
            async move {
                *sink.lock().unwrap() += batch.len();
                Ok(batch.len())
            }
        })
        .await
        .unwrap_err();

        // The two records before the failure were committed.
        assert_eq!(*written.lock().unwrap(), 2);
        assert!(err.to_string().contains("2 committed"));
    }
}
