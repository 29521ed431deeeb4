//! Table statistics consumed by the optimizer.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::error::DbResult;
use crate::filter::Filter;
use crate::router::Router;
use crate::rowgroup::{io, RowGroupMeta};
use crate::storage::StorageBackend;

/// Per-column summary across row groups.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ColumnSummary {
    pub null_count: u64,
    pub distinct_estimate: Option<u64>,
}

/// Statistics for the data a query may touch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableStatistics {
    /// Rows published in row groups.
    pub total_rows: u64,
    pub row_group_count: u64,
    /// Unflushed tail rows overlaid at execution time.
    pub tail_rows: u64,
    pub columns: HashMap<String, ColumnSummary>,
    /// Row-group metadata with the owning file path, for skip estimation.
    #[serde(skip_serializing)]
    pub row_groups: Vec<(String, RowGroupMeta)>,
    /// Fields frequently used in point lookups (for index suggestions).
    pub frequent_point_fields: Vec<String>,
}

/// Collect statistics for the paths a filter may touch.
///
/// # Errors
///
/// Surfaces storage failures; missing data files simply contribute nothing.
pub async fn collect(
    backend: &Arc<dyn StorageBackend>,
    router: &Router,
    namespace: &str,
    filter: Option<&Filter>,
) -> DbResult<TableStatistics> {
    let mut stats = TableStatistics::default();
    for path in router.resolve_data_paths(namespace, filter).await {
        let Some(file) = io::load_file(backend, &path).await? else { continue };
        for meta in file.metas() {
            stats.total_rows += meta.row_count;
            stats.row_group_count += 1;
            for column in &meta.columns {
                let summary = stats.columns.entry(column.name.clone()).or_default();
                summary.null_count += column.null_count;
                summary.distinct_estimate = match (summary.distinct_estimate, column.distinct_estimate) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }
            stats.row_groups.push((path.clone(), meta.clone()));
        }
    }
    Ok(stats)
}
