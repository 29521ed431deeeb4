//! In-process metrics collection.
//!
//! Snapshot structs behind `Arc<RwLock<...>>`, owned by the facade's context
//! and reset on disposal so repeated create/dispose cycles do not leak
//! counts across facades.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Write-path counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WriteMetrics {
    pub mutations: u64,
    pub events_appended: u64,
    pub rollbacks: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub backpressure_waits: u64,
}

/// Query-path counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub queries: u64,
    pub full_scans: u64,
    pub index_scans: u64,
    pub mv_hits: u64,
    pub point_lookups: u64,
    pub rows_returned: u64,
    pub cancelled: u64,
}

/// Combined snapshot
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub write: WriteMetrics,
    pub query: QueryMetrics,
}

/// Metrics collector shared across the engine.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    write: Arc<RwLock<WriteMetrics>>,
    query: Arc<RwLock<QueryMetrics>>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_mutation(&self, events: u64) {
        let mut write = self.write.write().await;
        write.mutations += 1;
        write.events_appended += events;
    }

    pub async fn record_rollback(&self) {
        self.write.write().await.rollbacks += 1;
    }

    pub async fn record_flush(&self, ok: bool) {
        let mut write = self.write.write().await;
        if ok {
            write.flushes += 1;
        } else {
            write.flush_failures += 1;
        }
    }

    pub async fn record_backpressure(&self) {
        self.write.write().await.backpressure_waits += 1;
    }

    pub async fn record_query(&self, strategy: crate::query::QueryStrategy, rows: u64) {
        use crate::query::QueryStrategy as S;
        let mut query = self.query.write().await;
        query.queries += 1;
        query.rows_returned += rows;
        match strategy {
            S::FullScan => query.full_scans += 1,
            S::MvLookup => query.mv_hits += 1,
            S::PointLookup => query.point_lookups += 1,
            _ => query.index_scans += 1,
        }
    }

    pub async fn record_cancelled(&self) {
        self.query.write().await.cancelled += 1;
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            write: *self.write.read().await,
            query: *self.query.read().await,
        }
    }

    /// Reset all counters (facade disposal).
    pub async fn reset(&self) {
        *self.write.write().await = WriteMetrics::default();
        *self.query.write().await = QueryMetrics::default();
    }
}
