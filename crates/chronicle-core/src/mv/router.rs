//! Materialized-view routing.

use serde::Serialize;
use serde_json::Value;

use crate::filter::{FieldPredicate, Filter};
use crate::model::value::values_equal;
use crate::model::CORE_FIELDS;
use crate::query::options::QueryOptions;

use super::{MaterializedView, MvDefinition, MvStaleness};

/// Routing decision for one query.
#[derive(Debug, Clone, Serialize)]
pub struct MvRouteDecision {
    pub can_use_mv: bool,
    pub mv_name: Option<String>,
    pub mv_definition: Option<MvDefinition>,
    pub needs_post_filter: bool,
    pub post_filter: Option<Value>,
    pub staleness: Option<MvStaleness>,
    /// Expected relative speedup in [0, 1]; 0 when no view is chosen.
    pub cost_savings: f64,
}

impl MvRouteDecision {
    fn none() -> Self {
        Self {
            can_use_mv: false,
            mv_name: None,
            mv_definition: None,
            needs_post_filter: false,
            post_filter: None,
            staleness: None,
            cost_savings: 0.0,
        }
    }
}

/// Decide whether any registered view can serve the query, and with what
/// residual post-filter.
///
/// Compatibility (all must hold): the query must pin every field the view's
/// filter pins, to a compatible value (an unpinned view field would make
/// view results a silent subset); `$ne`/`$nin` excluding the view's pinned
/// value disqualify; grouped views never serve row queries; with `$select`,
/// every projected and sort field outside the core set must be selected;
/// staleness must be fresh or stale-but-usable.
#[must_use]
pub fn route(
    namespace: &str,
    filter: &Filter,
    options: &QueryOptions,
    views: &[MaterializedView],
) -> MvRouteDecision {
    // Search roots need live indexes, not materialized rows.
    if has_search_root(filter) {
        return MvRouteDecision::none();
    }

    let ns = crate::model::namespace_path_segment(namespace);
    let mut best: Option<(CandidateScore, MvRouteDecision)> = None;

    for view in views {
        if crate::model::namespace_path_segment(&view.definition.source) != ns {
            continue;
        }
        let Some(candidate) = evaluate_candidate(view, filter, options) else { continue };
        let better = match &best {
            None => true,
            Some((best_score, _)) => candidate.0 > *best_score,
        };
        if better {
            best = Some(candidate);
        }
    }

    best.map_or_else(MvRouteDecision::none, |(_, decision)| decision)
}

/// Ordering: exact filter match, then no post-filter, then fresh over
/// stale, then structural savings (expansions avoided), then name.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
struct CandidateScore(bool, bool, bool, usize, std::cmp::Reverse<String>);

fn evaluate_candidate(
    view: &MaterializedView,
    filter: &Filter,
    options: &QueryOptions,
) -> Option<(CandidateScore, MvRouteDecision)> {
    let definition = &view.definition;

    // Regular row queries never read grouped views.
    if definition.is_grouped() {
        return None;
    }

    let staleness_penalty = match view.staleness {
        MvStaleness::Fresh => 0.0,
        MvStaleness::Stale { usable: true } => 0.2,
        MvStaleness::Stale { usable: false } | MvStaleness::Invalid => return None,
    };

    // Filter compatibility + absorbed predicates.
    let view_filter = match &definition.filter {
        None => Filter::True,
        Some(raw) => Filter::parse(raw).ok()?.normalize(),
    };
    let mut absorbed: Vec<(String, Value)> = Vec::new();
    for term in view_filter.conjunction_terms() {
        let Filter::Field { path, predicate: FieldPredicate::Eq(pinned) } = term else {
            // Views with non-equality filters only serve exact-match queries.
            if filter.to_value() == view_filter.to_value() {
                continue;
            }
            return None;
        };
        if query_conflicts(filter, path, pinned) {
            return None;
        }
        match filter.pinned_set(path) {
            // Query must pin the field to exactly the view's value set.
            Some(values) if values.iter().all(|v| values_equal(v, pinned)) => {
                absorbed.push((path.clone(), pinned.clone()));
            }
            _ => return None,
        }
    }

    // Projection/sort coverage under $select.
    if let Some(selected) = &definition.select {
        let covered = |field: &String| {
            CORE_FIELDS.contains(&field.as_str()) || selected.contains(field)
        };
        if let Some(projection) = &options.project {
            if !projection.fields().iter().all(covered) {
                return None;
            }
        }
        if !options.sort.iter().all(|(f, _)| covered(f)) {
            return None;
        }
        if !filter.referenced_paths().iter().all(covered) {
            return None;
        }
    }

    // Residual: query terms not absorbed by the view's pinned fields.
    let residual_terms: Vec<Filter> = filter
        .conjunction_terms()
        .into_iter()
        .filter(|term| match term {
            Filter::Field { path, predicate: FieldPredicate::Eq(value) } => {
                !absorbed.iter().any(|(p, v)| p == path && values_equal(v, value))
            }
            _ => true,
        })
        .cloned()
        .collect();
    let residual = Filter::And(residual_terms).normalize();
    let needs_post_filter = !residual.is_empty();
    let exact_match = !needs_post_filter && !absorbed.is_empty();

    let structural = definition.expand.len();
    let mut savings = 0.45 + 0.1 * structural as f64;
    if exact_match {
        savings += 0.25;
    } else if !needs_post_filter {
        savings += 0.15;
    }
    savings = (savings - staleness_penalty).clamp(0.0, 1.0);

    let score = CandidateScore(
        exact_match,
        !needs_post_filter,
        view.staleness == MvStaleness::Fresh,
        structural,
        std::cmp::Reverse(definition.name.clone()),
    );
    let decision = MvRouteDecision {
        can_use_mv: true,
        mv_name: Some(definition.name.clone()),
        mv_definition: Some(definition.clone()),
        needs_post_filter,
        post_filter: needs_post_filter.then(|| residual.to_value()),
        staleness: Some(view.staleness),
        cost_savings: savings,
    };
    Some((score, decision))
}

/// `$ne`/`$nin` that exclude the view's pinned value, or equality/`$in`
/// disjoint from it.
fn query_conflicts(filter: &Filter, path: &str, pinned: &Value) -> bool {
    for term in filter.conjunction_terms() {
        let Filter::Field { path: p, predicate } = term else { continue };
        if p != path {
            continue;
        }
        match predicate {
            FieldPredicate::Eq(v) if !values_equal(v, pinned) => return true,
            FieldPredicate::In(vs) if !vs.iter().any(|v| values_equal(v, pinned)) => return true,
            FieldPredicate::Ne(v) if values_equal(v, pinned) => return true,
            FieldPredicate::Nin(vs) if vs.iter().any(|v| values_equal(v, pinned)) => return true,
            _ => {}
        }
    }
    false
}

fn has_search_root(filter: &Filter) -> bool {
    match filter {
        Filter::Text { .. } | Filter::Vector(_) => true,
        Filter::And(terms) => terms.iter().any(has_search_root),
        _ => false,
    }
}
