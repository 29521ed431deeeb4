//! Query plan model.

use serde::Serialize;
use serde_json::Value;

use crate::filter::{FieldPredicate, Filter};
use crate::index::SelectedIndex;

/// Physical access strategy chosen by the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStrategy {
    FullScan,
    RangeScan,
    HashLookup,
    FtsSearch,
    VectorSearch,
    HybridSearch,
    MvLookup,
    PointLookup,
}

/// A predicate evaluated against row-group statistics before decoding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushedPredicate {
    pub column: String,
    pub op: String,
    pub value: Value,
}

/// Pushdown split: pushed predicates plus the residual filter that must
/// still run per row.
#[derive(Debug, Clone, Serialize)]
pub struct PredicatePushdown {
    pub pushed_predicates: Vec<PushedPredicate>,
    pub remaining_filter: Value,
    pub estimated_skipped_row_groups: u64,
}

/// Columns the plan needs, by purpose, plus the union the executor decodes.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnPruning {
    pub filter_columns: Vec<String>,
    pub projection_columns: Vec<String>,
    pub sort_columns: Vec<String>,
    /// Union of the above plus the always-present core fields.
    pub required_columns: Vec<String>,
}

/// The chosen index and its expected benefit.
#[derive(Debug, Clone, Serialize)]
pub struct IndexRecommendation {
    pub index: SelectedIndex,
    pub selectivity: f64,
    /// Relative cost reduction vs. a full scan, in [0, 1].
    pub cost_reduction: f64,
}

/// Cost split used for plan choice.
#[derive(Debug, Clone, Serialize)]
pub struct CostEstimate {
    pub io_cost: f64,
    pub cpu_cost: f64,
    pub total_cost: f64,
    pub estimated_rows_scanned: u64,
    /// Capped by `limit` when present.
    pub estimated_rows_returned: u64,
}

/// Advisory plan improvement, ordered by priority (1 = highest).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    AddLimit,
    AddProjection,
    CreateIndex,
    RewriteOrAsUnions,
    RewritePrefixRegex,
}

#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub priority: u8,
    pub message: String,
}

/// Compiled plan: the serializable explanation plus the compiled filters the
/// executor runs.
#[derive(Debug, Clone, Serialize)]
pub struct QueryPlan {
    pub namespace: String,
    pub original_filter: Value,
    pub optimized_filter: Value,
    pub strategy: QueryStrategy,
    pub pushdown: PredicatePushdown,
    pub column_pruning: ColumnPruning,
    pub index_recommendation: Option<IndexRecommendation>,
    pub estimated_cost: CostEstimate,
    pub suggestions: Vec<Suggestion>,
    /// Normalized filter the executor evaluates per row.
    #[serde(skip_serializing)]
    pub compiled_filter: Filter,
    /// Pushed predicates in executor form (column, predicate).
    #[serde(skip_serializing)]
    pub pushed: Vec<(String, FieldPredicate)>,
}

impl QueryPlan {
    /// Whether the plan routes through an index-provided id stream.
    #[must_use]
    pub const fn uses_id_stream(&self) -> bool {
        matches!(
            self.strategy,
            QueryStrategy::FtsSearch | QueryStrategy::VectorSearch | QueryStrategy::HybridSearch
        )
    }
}
