//! Top-level configuration.

use std::time::Duration;

use crate::cache::RowGroupCacheConfig;
use crate::event::FlushConfig;
use crate::ingest::IngestConfig;
use crate::router::RouterConfig;
use crate::storage::{CircuitBreakerConfig, RetryConfig};

/// Aggregated engine configuration; each component keeps its own struct.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub flush: FlushConfig,
    pub row_group_cache: RowGroupCacheConfig,
    pub retry: RetryConfig,
    /// `None` disables circuit breaking.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub router: RouterConfig,
    pub ingest: IngestConfig,
    /// Bounded entries in the point-in-time reconstruction cache.
    pub reconstruction_entries: usize,
    /// In-memory event ring kept for export polling.
    pub export_ring: usize,
    /// Fields become "frequent point lookup" suggestions past this count.
    pub hot_field_threshold: u64,
    /// Time budget for the final flush during disposal.
    pub dispose_flush_budget: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            flush: FlushConfig::default(),
            row_group_cache: RowGroupCacheConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: Some(CircuitBreakerConfig::default()),
            router: RouterConfig::default(),
            ingest: IngestConfig::default(),
            reconstruction_entries: 4_096,
            export_ring: 10_000,
            hot_field_threshold: 32,
            dispose_flush_budget: Duration::from_secs(10),
        }
    }
}
