//! Cost-based query planning.
//!
//! Compiles a filter + options into a [`QueryPlan`]: normalization, predicate
//! pushdown against row-group statistics, column pruning, index selection,
//! cost estimation, and prioritized suggestions.

use serde_json::Value;
use tracing::instrument;

use crate::error::DbResult;
use crate::filter::{FieldPredicate, Filter};
use crate::index::{IndexKind, SelectedIndex};
use crate::model::CORE_FIELDS;
use crate::query::options::QueryOptions;
use crate::query::plan::{
    ColumnPruning, CostEstimate, IndexRecommendation, PredicatePushdown, PushedPredicate,
    QueryPlan, QueryStrategy, Suggestion, SuggestionKind,
};
use crate::query::stats::TableStatistics;

/// Cost of touching one row group (open + stats + decode overhead).
pub const ROW_GROUP_SCAN_COST: f64 = 10.0;
/// Cost of materializing one row.
pub const ROW_READ_COST: f64 = 1.0;
/// Cost of evaluating the residual filter on one row.
pub const ROW_FILTER_COST: f64 = 0.1;
/// I/O discount when bloom filters can reject groups for pushed equalities.
pub const BLOOM_FILTER_FACTOR: f64 = 0.3;
/// Full-text matches are assumed to touch at least this fraction of rows.
pub const FTS_SELECTIVITY_FLOOR: f64 = 0.1;
/// Assumed fraction of rows surviving one non-indexed pushed predicate.
const DEFAULT_PREDICATE_SELECTIVITY: f64 = 0.3;
/// Scans above this size without a limit draw an `AddLimit` suggestion.
const LARGE_SCAN_THRESHOLD: u64 = 1_000;

/// Compile a plan.
///
/// # Errors
///
/// Fails on a malformed filter document.
#[instrument(level = "debug", skip_all, fields(namespace = %namespace))]
pub fn optimize(
    namespace: &str,
    raw_filter: &Value,
    options: &QueryOptions,
    stats: &TableStatistics,
    selected: Option<SelectedIndex>,
) -> DbResult<QueryPlan> {
    let compiled = Filter::parse(raw_filter)?.normalize();
    let optimized_filter = compiled.to_value();

    // Pushdown split over the top-level conjunction.
    let (pushed, remaining) = split_pushdown(&compiled);
    let remaining_value = remaining.to_value();

    let estimated_skipped = stats
        .row_groups
        .iter()
        .filter(|(_, meta)| pushed.iter().any(|(col, pred)| meta.skippable(col, pred)))
        .count() as u64;

    let pruning = prune_columns(&compiled, options);
    let strategy = choose_strategy(&compiled, selected.as_ref());
    let cost = estimate_cost(options, stats, selected.as_ref(), estimated_skipped, &pushed);

    let index_recommendation = selected.map(|index| {
        let full = full_scan_cost(stats);
        let reduction = if full.total_cost > 0.0 {
            ((full.total_cost - cost.total_cost) / full.total_cost).clamp(0.0, 1.0)
        } else {
            0.0
        };
        IndexRecommendation {
            selectivity: index.selectivity,
            cost_reduction: reduction,
            index,
        }
    });

    let suggestions = build_suggestions(&compiled, options, stats, index_recommendation.as_ref(), &cost);

    Ok(QueryPlan {
        namespace: namespace.to_string(),
        original_filter: raw_filter.clone(),
        optimized_filter,
        strategy,
        pushdown: PredicatePushdown {
            pushed_predicates: pushed
                .iter()
                .map(|(column, pred)| PushedPredicate {
                    column: column.clone(),
                    op: pred.operator().to_string(),
                    value: predicate_value(pred),
                })
                .collect(),
            remaining_filter: remaining_value,
            estimated_skipped_row_groups: estimated_skipped,
        },
        column_pruning: pruning,
        index_recommendation,
        estimated_cost: cost,
        suggestions,
        compiled_filter: compiled,
        pushed,
    })
}

/// Split the top-level conjunction into pushable predicates and the residual
/// filter. Pushable: scalar equality, `$eq`, `$in`, and ordered comparators
/// on top-level columns. `$or`, `$not`, `$ne`/`$nin`, `$regex`, `$exists`,
/// `$text`, `$vector`, and dotted paths stay in the residual (dotted paths
/// are nested inside a column, so group statistics cannot exclude them).
fn split_pushdown(filter: &Filter) -> (Vec<(String, FieldPredicate)>, Filter) {
    let mut pushed = Vec::new();
    let mut remaining = Vec::new();

    for term in filter.conjunction_terms() {
        match term {
            Filter::Field { path, predicate } if is_pushable(path, predicate) => {
                pushed.push((path.clone(), predicate.clone()));
            }
            other => remaining.push(other.clone()),
        }
    }

    (pushed, Filter::And(remaining).normalize())
}

fn is_pushable(path: &str, predicate: &FieldPredicate) -> bool {
    if path.contains('.') {
        return false;
    }
    match predicate {
        FieldPredicate::Eq(v)
        | FieldPredicate::Gt(v)
        | FieldPredicate::Gte(v)
        | FieldPredicate::Lt(v)
        | FieldPredicate::Lte(v) => is_scalar(v),
        FieldPredicate::In(vs) => !vs.is_empty() && vs.iter().all(is_scalar),
        _ => false,
    }
}

fn is_scalar(value: &Value) -> bool {
    !(value.is_array() || value.is_object())
}

fn predicate_value(predicate: &FieldPredicate) -> Value {
    match predicate {
        FieldPredicate::Eq(v)
        | FieldPredicate::Ne(v)
        | FieldPredicate::Gt(v)
        | FieldPredicate::Gte(v)
        | FieldPredicate::Lt(v)
        | FieldPredicate::Lte(v) => v.clone(),
        FieldPredicate::In(vs) | FieldPredicate::Nin(vs) => Value::Array(vs.clone()),
        FieldPredicate::Regex(p) => Value::String(p.clone()),
        FieldPredicate::Exists(b) => Value::Bool(*b),
    }
}

fn prune_columns(filter: &Filter, options: &QueryOptions) -> ColumnPruning {
    let filter_columns = filter.referenced_paths();
    let projection_columns: Vec<String> = options
        .project
        .as_ref()
        .map(|p| p.fields().to_vec())
        .unwrap_or_default();
    let sort_columns: Vec<String> = options.sort.iter().map(|(f, _)| f.clone()).collect();

    // Row groups store top-level columns; nested paths decode their root.
    let mut required: Vec<String> = CORE_FIELDS.iter().map(ToString::to_string).collect();
    for path in filter_columns
        .iter()
        .chain(projection_columns.iter())
        .chain(sort_columns.iter())
    {
        let root = path.split('.').next().unwrap_or(path).to_string();
        if !required.contains(&root) {
            required.push(root);
        }
    }

    ColumnPruning {
        filter_columns,
        projection_columns,
        sort_columns,
        required_columns: required,
    }
}

fn choose_strategy(filter: &Filter, selected: Option<&SelectedIndex>) -> QueryStrategy {
    let has_text = contains_text(filter);
    let has_vector = contains_vector(filter);
    match (has_text, has_vector) {
        (true, true) => return QueryStrategy::HybridSearch,
        (true, false) => return QueryStrategy::FtsSearch,
        (false, true) => return QueryStrategy::VectorSearch,
        (false, false) => {}
    }

    if filter.pinned_value("$id").is_some() {
        return QueryStrategy::PointLookup;
    }

    match selected.map(|s| &s.kind) {
        Some(IndexKind::Hash) => QueryStrategy::HashLookup,
        Some(IndexKind::Range) => QueryStrategy::RangeScan,
        Some(IndexKind::Composite) => {
            // A fully covered composite behaves like a hash lookup; a prefix
            // behaves like an ordered scan.
            QueryStrategy::HashLookup
        }
        Some(IndexKind::FullText) => QueryStrategy::FtsSearch,
        Some(IndexKind::Vector { .. }) => QueryStrategy::VectorSearch,
        None => QueryStrategy::FullScan,
    }
}

fn contains_text(filter: &Filter) -> bool {
    match filter {
        Filter::Text { .. } => true,
        Filter::And(terms) => terms.iter().any(contains_text),
        _ => false,
    }
}

fn contains_vector(filter: &Filter) -> bool {
    match filter {
        Filter::Vector(_) => true,
        Filter::And(terms) => terms.iter().any(contains_vector),
        _ => false,
    }
}

fn full_scan_cost(stats: &TableStatistics) -> CostEstimate {
    let rows = stats.total_rows + stats.tail_rows;
    let io = stats.row_group_count as f64 * ROW_GROUP_SCAN_COST + rows as f64 * ROW_READ_COST;
    let cpu = rows as f64 * ROW_FILTER_COST;
    CostEstimate {
        io_cost: io,
        cpu_cost: cpu,
        total_cost: io + cpu,
        estimated_rows_scanned: rows,
        estimated_rows_returned: rows,
    }
}

fn estimate_cost(
    options: &QueryOptions,
    stats: &TableStatistics,
    selected: Option<&SelectedIndex>,
    skipped_groups: u64,
    pushed: &[(String, FieldPredicate)],
) -> CostEstimate {
    let groups_scanned = stats.row_group_count.saturating_sub(skipped_groups);
    let group_fraction = if stats.row_group_count == 0 {
        0.0
    } else {
        groups_scanned as f64 / stats.row_group_count as f64
    };
    let published_scanned = (stats.total_rows as f64 * group_fraction).ceil() as u64;

    let rows_scanned = match selected {
        Some(index) => index.estimated_rows.min(published_scanned + stats.tail_rows),
        None => published_scanned + stats.tail_rows,
    };

    let has_pushed_equality = pushed
        .iter()
        .any(|(_, p)| matches!(p, FieldPredicate::Eq(_) | FieldPredicate::In(_)));
    let mut io_cost =
        groups_scanned as f64 * ROW_GROUP_SCAN_COST + rows_scanned as f64 * ROW_READ_COST;
    if has_pushed_equality {
        io_cost *= BLOOM_FILTER_FACTOR;
    }

    let mut cpu_cost = rows_scanned as f64 * ROW_FILTER_COST;
    if !options.sort.is_empty() && rows_scanned > 1 {
        cpu_cost += rows_scanned as f64 * (rows_scanned as f64).log2() * 0.01;
    }

    let match_fraction = match selected {
        Some(index) => match index.kind {
            IndexKind::FullText => index.selectivity.max(FTS_SELECTIVITY_FLOOR),
            _ => index.selectivity,
        },
        None => DEFAULT_PREDICATE_SELECTIVITY.powi(pushed.len() as i32),
    };
    let matched = ((rows_scanned as f64) * match_fraction).ceil() as u64;
    let estimated_rows_returned = match options.limit {
        Some(limit) => matched.min(limit as u64),
        None => matched,
    };

    CostEstimate {
        io_cost,
        cpu_cost,
        total_cost: io_cost + cpu_cost,
        estimated_rows_scanned: rows_scanned,
        estimated_rows_returned,
    }
}

fn build_suggestions(
    filter: &Filter,
    options: &QueryOptions,
    stats: &TableStatistics,
    index: Option<&IndexRecommendation>,
    cost: &CostEstimate,
) -> Vec<Suggestion> {
    let mut suggestions = Vec::new();

    if options.limit.is_none() && cost.estimated_rows_scanned > LARGE_SCAN_THRESHOLD {
        suggestions.push(Suggestion {
            kind: SuggestionKind::AddLimit,
            priority: 1,
            message: format!(
                "scan touches ~{} rows with no limit; add a limit to bound the result",
                cost.estimated_rows_scanned
            ),
        });
    }

    // Point lookups on fields the workload hits often deserve an index.
    if index.is_none() {
        for (path, predicate) in pushed_equalities(filter) {
            if stats.frequent_point_fields.iter().any(|f| f == &path) {
                suggestions.push(Suggestion {
                    kind: SuggestionKind::CreateIndex,
                    priority: 2,
                    message: format!(
                        "field '{path}' is a frequent {} lookup target; create a hash index",
                        predicate.operator()
                    ),
                });
            }
        }
    }

    if let Some(prefix) = anchored_prefix_regex(filter) {
        suggestions.push(Suggestion {
            kind: SuggestionKind::RewritePrefixRegex,
            priority: 2,
            message: format!(
                "anchored regex '^{prefix}' is a prefix match; rewrite to a range predicate for pushdown"
            ),
        });
    }

    if options.project.is_none() {
        suggestions.push(Suggestion {
            kind: SuggestionKind::AddProjection,
            priority: 3,
            message: "no projection specified; project needed fields to reduce decode work".into(),
        });
    }

    if contains_or(filter) {
        suggestions.push(Suggestion {
            kind: SuggestionKind::RewriteOrAsUnions,
            priority: 4,
            message: "$or prevents pushdown; rewrite as a union of separate queries".into(),
        });
    }

    suggestions.sort_by_key(|s| s.priority);
    suggestions
}

fn pushed_equalities(filter: &Filter) -> Vec<(String, &FieldPredicate)> {
    filter
        .conjunction_terms()
        .into_iter()
        .filter_map(|term| match term {
            Filter::Field { path, predicate }
                if matches!(predicate, FieldPredicate::Eq(_) | FieldPredicate::In(_)) =>
            {
                Some((path.clone(), predicate))
            }
            _ => None,
        })
        .collect()
}

fn contains_or(filter: &Filter) -> bool {
    match filter {
        Filter::Or(_) => true,
        Filter::And(terms) => terms.iter().any(contains_or),
        Filter::Not(inner) => contains_or(inner),
        _ => false,
    }
}

/// The literal prefix of an anchored `$regex` (`^prefix`) with no remaining
/// metacharacters, if the filter carries one.
fn anchored_prefix_regex(filter: &Filter) -> Option<String> {
    for term in filter.conjunction_terms() {
        if let Filter::Field { predicate: FieldPredicate::Regex(pattern), .. } = term {
            if let Some(rest) = pattern.strip_prefix('^') {
                let literal = !rest
                    .chars()
                    .any(|c| ".*+?()[]{}|\\$".contains(c));
                if literal && !rest.is_empty() {
                    return Some(rest.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(filter: Value) -> QueryPlan {
        optimize(
            "users",
            &filter,
            &QueryOptions::default(),
            &TableStatistics::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_cost_constant_invariants() {
        assert!(ROW_GROUP_SCAN_COST > ROW_READ_COST);
        assert!(ROW_READ_COST > ROW_FILTER_COST);
        assert!(ROW_FILTER_COST > 0.0);
        assert!(BLOOM_FILTER_FACTOR < 1.0);
        assert!((FTS_SELECTIVITY_FLOOR - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_conjunction_pushdown() {
        let plan = plan(json!({"status": "active", "age": {"$gte": 18, "$lt": 65}}));
        assert_eq!(plan.pushdown.pushed_predicates.len(), 3);
        let ops: Vec<&str> = plan
            .pushdown
            .pushed_predicates
            .iter()
            .map(|p| p.op.as_str())
            .collect();
        assert!(ops.contains(&"$eq"));
        assert!(ops.contains(&"$gte"));
        assert!(ops.contains(&"$lt"));
        // Everything was pushed; residual matches all rows.
        assert_eq!(plan.pushdown.remaining_filter, json!({}));
    }

    #[test]
    fn test_or_is_not_pushed() {
        let plan = plan(json!({"$or": [{"a": 1}, {"b": 2}]}));
        assert!(plan.pushdown.pushed_predicates.is_empty());
        assert!(plan.pushdown.remaining_filter.get("$or").is_some());
    }

    #[test]
    fn test_negations_and_regex_stay_residual() {
        let plan = plan(json!({
            "a": {"$ne": 1},
            "b": {"$nin": [1, 2]},
            "c": {"$regex": "x.*"},
            "d": {"$exists": true},
            "e": 5
        }));
        assert_eq!(plan.pushdown.pushed_predicates.len(), 1);
        assert_eq!(plan.pushdown.pushed_predicates[0].column, "e");
    }

    #[test]
    fn test_dotted_paths_not_pushed() {
        let plan = plan(json!({"profile.city": "berlin"}));
        assert!(plan.pushdown.pushed_predicates.is_empty());
    }

    #[test]
    fn test_pushdown_soundness_pushed_and_remaining_equal_original() {
        use crate::model::{Entity, EntityId};
        use chrono::Utc;
        use serde_json::Map;

        let raw = json!({
            "status": "active",
            "age": {"$gte": 18, "$lt": 65},
            "name": {"$regex": "^A"},
            "$or": [{"tier": "pro"}, {"tier": "trial"}]
        });
        let plan = plan(raw.clone());
        let original = Filter::parse(&raw).unwrap().normalize();
        let remaining = Filter::parse(&plan.pushdown.remaining_filter).unwrap().normalize();

        let rows = [
            json!({"status": "active", "age": 30, "name": "Ada", "tier": "pro"}),
            json!({"status": "active", "age": 30, "name": "Bob", "tier": "pro"}),
            json!({"status": "idle", "age": 30, "name": "Ada", "tier": "pro"}),
            json!({"status": "active", "age": 70, "name": "Ada", "tier": "trial"}),
            json!({"status": "active", "age": 20, "name": "Ada", "tier": "basic"}),
            json!({"age": 20, "name": "Ada", "tier": "pro"}),
        ];
        for row in rows {
            let map: Map<String, Value> = row.as_object().cloned().unwrap();
            let entity = Entity::create(EntityId::new("users", "u"), "User".into(), map, "t", Utc::now());
            let pushed_ok = plan.pushed.iter().all(|(path, pred)| {
                Filter::Field { path: path.clone(), predicate: pred.clone() }.matches(&entity)
            });
            assert_eq!(
                original.matches(&entity),
                pushed_ok && remaining.matches(&entity),
                "pushdown split must be equivalent for {entity:?}"
            );
        }
    }

    #[test]
    fn test_required_columns_include_core_fields() {
        let plan = optimize(
            "users",
            &json!({"profile.city": "berlin"}),
            &QueryOptions::default().with_sort("age", crate::query::options::SortDirection::Asc),
            &TableStatistics::default(),
            None,
        )
        .unwrap();
        for core in CORE_FIELDS {
            assert!(plan.column_pruning.required_columns.iter().any(|c| c == core));
        }
        // Nested paths decode their root column.
        assert!(plan.column_pruning.required_columns.iter().any(|c| c == "profile"));
        assert!(plan.column_pruning.required_columns.iter().any(|c| c == "age"));
    }

    #[test]
    fn test_strategies() {
        assert_eq!(plan(json!({})).strategy, QueryStrategy::FullScan);
        assert_eq!(plan(json!({"$id": "users/u1"})).strategy, QueryStrategy::PointLookup);
        assert_eq!(
            plan(json!({"$text": {"$search": "rust"}})).strategy,
            QueryStrategy::FtsSearch
        );
        assert_eq!(
            plan(json!({"$vector": {"query": [1.0], "field": "v", "topK": 3}})).strategy,
            QueryStrategy::VectorSearch
        );
        assert_eq!(
            plan(json!({
                "$text": {"$search": "rust"},
                "$vector": {"query": [1.0], "field": "v", "topK": 3}
            }))
            .strategy,
            QueryStrategy::HybridSearch
        );
    }

    #[test]
    fn test_suggestions_ordering_and_kinds() {
        let mut stats = TableStatistics {
            total_rows: 10_000,
            row_group_count: 10,
            ..TableStatistics::default()
        };
        stats.frequent_point_fields.push("email".into());

        let plan = optimize(
            "users",
            &json!({"email": "a@b", "$or": [{"x": 1}, {"y": 2}], "name": {"$regex": "^Ada"}}),
            &QueryOptions::default(),
            &stats,
            None,
        )
        .unwrap();

        let kinds: Vec<&SuggestionKind> = plan.suggestions.iter().map(|s| &s.kind).collect();
        assert!(kinds.contains(&&SuggestionKind::AddLimit));
        assert!(kinds.contains(&&SuggestionKind::CreateIndex));
        assert!(kinds.contains(&&SuggestionKind::RewritePrefixRegex));
        assert!(kinds.contains(&&SuggestionKind::AddProjection));
        assert!(kinds.contains(&&SuggestionKind::RewriteOrAsUnions));
        // Sorted by priority.
        let priorities: Vec<u8> = plan.suggestions.iter().map(|s| s.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort_unstable();
        assert_eq!(priorities, sorted);
    }

    #[test]
    fn test_index_reduces_cost() {
        let stats = TableStatistics {
            total_rows: 100_000,
            row_group_count: 100,
            ..TableStatistics::default()
        };
        let selected = SelectedIndex {
            name: "by_status".into(),
            kind: IndexKind::Hash,
            fields: vec!["status".into()],
            estimated_rows: 10,
            selectivity: 0.0001,
        };
        let indexed = optimize(
            "users",
            &json!({"status": "active"}),
            &QueryOptions::default(),
            &stats,
            Some(selected),
        )
        .unwrap();
        let scanned = optimize(
            "users",
            &json!({"nothing_indexed": {"$exists": true}}),
            &QueryOptions::default(),
            &stats,
            None,
        )
        .unwrap();

        assert!(indexed.estimated_cost.total_cost < scanned.estimated_cost.total_cost);
        let rec = indexed.index_recommendation.unwrap();
        assert!(rec.cost_reduction > 0.5);
    }

    #[test]
    fn test_rows_returned_capped_by_limit() {
        let stats = TableStatistics {
            total_rows: 10_000,
            row_group_count: 10,
            ..TableStatistics::default()
        };
        let plan = optimize(
            "users",
            &json!({}),
            &QueryOptions::default().with_limit(25),
            &stats,
            None,
        )
        .unwrap();
        assert_eq!(plan.estimated_cost.estimated_rows_returned, 25);
    }

    #[test]
    fn test_normalization_flattens_and_unwraps() {
        let plan = plan(json!({"$and": [{"a": 1}, {"$and": [{"b": 2}]}]}));
        assert_eq!(plan.optimized_filter["a"], json!(1));
        assert_eq!(plan.optimized_filter["b"], json!(2));
        assert!(plan.optimized_filter.get("$and").is_none());
    }
}
