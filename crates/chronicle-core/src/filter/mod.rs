//! Wire-level filter language.
//!
//! A filter is a JSON document mapping field paths to predicates, with the
//! logical combinators `$and` / `$or` / `$not` and the search roots `$text`
//! and `$vector` at the top level. This module parses the wire form into a
//! typed AST, normalizes it for the optimizer, and evaluates it against
//! entity snapshots.

mod eval;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ChronicleError, DbResult};

/// Vector search root: nearest-`top_k` by cosine similarity over a
/// fixed-dimension embedding field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorQuery {
    pub query: Vec<f64>,
    pub field: String,
    pub top_k: usize,
}

/// Predicate applied to a single field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldPredicate {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Regex(String),
    Exists(bool),
}

impl FieldPredicate {
    /// Wire operator name.
    #[must_use]
    pub const fn operator(&self) -> &'static str {
        match self {
            Self::Eq(_) => "$eq",
            Self::Ne(_) => "$ne",
            Self::Gt(_) => "$gt",
            Self::Gte(_) => "$gte",
            Self::Lt(_) => "$lt",
            Self::Lte(_) => "$lte",
            Self::In(_) => "$in",
            Self::Nin(_) => "$nin",
            Self::Regex(_) => "$regex",
            Self::Exists(_) => "$exists",
        }
    }

    /// Whether this predicate is an ordered comparator.
    #[must_use]
    pub const fn is_ordered(&self) -> bool {
        matches!(self, Self::Gt(_) | Self::Gte(_) | Self::Lt(_) | Self::Lte(_))
    }
}

/// Typed filter AST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Matches every row (the empty filter document).
    True,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Field { path: String, predicate: FieldPredicate },
    Text { search: String },
    Vector(VectorQuery),
}

impl Filter {
    /// Parse a wire-level filter document.
    ///
    /// # Errors
    ///
    /// Returns a validation error on unknown operators, malformed `$text` /
    /// `$vector` roots, or non-object filter documents.
    pub fn parse(raw: &Value) -> DbResult<Self> {
        let map = raw
            .as_object()
            .ok_or_else(|| ChronicleError::validation("filter must be a JSON object"))?;

        let mut terms = Vec::with_capacity(map.len());
        for (key, value) in map {
            terms.push(Self::parse_entry(key, value)?);
        }
        Ok(match terms.len() {
            0 => Self::True,
            1 => terms.remove(0),
            _ => Self::And(terms),
        })
    }

    fn parse_entry(key: &str, value: &Value) -> DbResult<Self> {
        match key {
            "$and" | "$or" => {
                let items = value.as_array().ok_or_else(|| {
                    ChronicleError::validation(format!("{key} expects an array of filters"))
                })?;
                let parsed: DbResult<Vec<Self>> = items.iter().map(Self::parse).collect();
                let parsed = parsed?;
                Ok(if key == "$and" { Self::And(parsed) } else { Self::Or(parsed) })
            }
            "$not" => Ok(Self::Not(Box::new(Self::parse(value)?))),
            "$text" => {
                let search = value
                    .get("$search")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ChronicleError::validation("$text expects {$search: string}"))?;
                Ok(Self::Text { search: search.to_string() })
            }
            "$vector" => {
                let query = value
                    .get("query")
                    .and_then(Value::as_array)
                    .ok_or_else(|| ChronicleError::validation("$vector expects a query array"))?
                    .iter()
                    .map(|v| v.as_f64().ok_or_else(|| ChronicleError::validation("$vector query must be numeric")))
                    .collect::<DbResult<Vec<f64>>>()?;
                let field = value
                    .get("field")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ChronicleError::validation("$vector expects a field name"))?;
                let top_k = value
                    .get("topK")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| ChronicleError::validation("$vector expects an integer topK"))?;
                Ok(Self::Vector(VectorQuery {
                    query,
                    field: field.to_string(),
                    top_k: top_k as usize,
                }))
            }
            _ if key.starts_with('$') => Err(ChronicleError::validation(format!(
                "unknown filter operator '{key}'"
            ))),
            path => Self::parse_field(path, value),
        }
    }

    fn parse_field(path: &str, value: &Value) -> DbResult<Self> {
        let Some(ops) = value.as_object().filter(|m| m.keys().any(|k| k.starts_with('$'))) else {
            // Scalars (and plain objects) are implicit equality.
            return Ok(Self::Field {
                path: path.to_string(),
                predicate: FieldPredicate::Eq(value.clone()),
            });
        };

        let mut predicates = Vec::with_capacity(ops.len());
        for (op, operand) in ops {
            let predicate = match op.as_str() {
                "$eq" => FieldPredicate::Eq(operand.clone()),
                "$ne" => FieldPredicate::Ne(operand.clone()),
                "$gt" => FieldPredicate::Gt(operand.clone()),
                "$gte" => FieldPredicate::Gte(operand.clone()),
                "$lt" => FieldPredicate::Lt(operand.clone()),
                "$lte" => FieldPredicate::Lte(operand.clone()),
                "$in" | "$nin" => {
                    let values = operand.as_array().ok_or_else(|| {
                        ChronicleError::validation(format!("{op} expects an array of values"))
                    })?;
                    if op == "$in" {
                        FieldPredicate::In(values.clone())
                    } else {
                        FieldPredicate::Nin(values.clone())
                    }
                }
                "$regex" => {
                    let pattern = operand.as_str().ok_or_else(|| {
                        ChronicleError::validation("$regex expects a string pattern")
                    })?;
                    regex::Regex::new(pattern).map_err(|e| {
                        ChronicleError::validation(format!("invalid $regex pattern: {e}"))
                    })?;
                    FieldPredicate::Regex(pattern.to_string())
                }
                "$exists" => {
                    let flag = operand.as_bool().ok_or_else(|| {
                        ChronicleError::validation("$exists expects a boolean")
                    })?;
                    FieldPredicate::Exists(flag)
                }
                other => {
                    return Err(ChronicleError::validation(format!(
                        "unknown predicate operator '{other}' on field '{path}'"
                    )))
                }
            };
            predicates.push(Self::Field {
                path: path.to_string(),
                predicate,
            });
        }
        Ok(match predicates.len() {
            1 => predicates.remove(0),
            _ => Self::And(predicates),
        })
    }

    /// Normalize the AST: nested conjunctions are flattened, singleton
    /// conjunctions/disjunctions unwrapped, double negation removed, and
    /// `True` terms dropped from conjunctions.
    #[must_use]
    pub fn normalize(self) -> Self {
        match self {
            Self::And(terms) => {
                let mut flat = Vec::with_capacity(terms.len());
                for term in terms {
                    match term.normalize() {
                        Self::True => {}
                        Self::And(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                match flat.len() {
                    0 => Self::True,
                    1 => flat.remove(0),
                    _ => Self::And(flat),
                }
            }
            Self::Or(terms) => {
                let mut flat: Vec<Self> = terms.into_iter().map(Self::normalize).collect();
                match flat.len() {
                    0 => Self::True,
                    1 => flat.remove(0),
                    _ => Self::Or(flat),
                }
            }
            Self::Not(inner) => match inner.normalize() {
                Self::Not(restored) => *restored,
                other => Self::Not(Box::new(other)),
            },
            other => other,
        }
    }

    /// Whether this filter matches every row.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::True)
    }

    /// All field paths referenced by the filter, for column pruning.
    #[must_use]
    pub fn referenced_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.collect_paths(&mut paths);
        paths.sort();
        paths.dedup();
        paths
    }

    fn collect_paths(&self, out: &mut Vec<String>) {
        match self {
            Self::True | Self::Text { .. } => {}
            Self::And(terms) | Self::Or(terms) => {
                for term in terms {
                    term.collect_paths(out);
                }
            }
            Self::Not(inner) => inner.collect_paths(out),
            Self::Field { path, .. } => out.push(path.clone()),
            Self::Vector(v) => out.push(v.field.clone()),
        }
    }

    /// Top-level conjunction terms (a non-conjunction filter is one term).
    #[must_use]
    pub fn conjunction_terms(&self) -> Vec<&Self> {
        match self {
            Self::And(terms) => terms.iter().collect(),
            Self::True => Vec::new(),
            other => vec![other],
        }
    }

    /// Reconstruct the wire-level document form.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::True => Value::Object(Map::new()),
            Self::And(terms) => {
                // Conjunctions merge back into a flat document where possible.
                let mut merged = Map::new();
                let mut overflow = Vec::new();
                for term in terms {
                    match term.to_value() {
                        Value::Object(obj) => {
                            for (k, v) in obj {
                                match merged.get_mut(&k) {
                                    None => {
                                        merged.insert(k, v);
                                    }
                                    Some(Value::Object(existing)) if v.is_object() => {
                                        if let Value::Object(incoming) = v {
                                            existing.extend(incoming);
                                        }
                                    }
                                    Some(_) => overflow.push(Value::Object(
                                        [(k, v)].into_iter().collect(),
                                    )),
                                }
                            }
                        }
                        other => overflow.push(other),
                    }
                }
                if overflow.is_empty() {
                    Value::Object(merged)
                } else {
                    if !merged.is_empty() {
                        overflow.insert(0, Value::Object(merged));
                    }
                    Value::Object([("$and".to_string(), Value::Array(overflow))].into_iter().collect())
                }
            }
            Self::Or(terms) => Value::Object(
                [("$or".to_string(), Value::Array(terms.iter().map(Self::to_value).collect()))]
                    .into_iter()
                    .collect(),
            ),
            Self::Not(inner) => Value::Object(
                [("$not".to_string(), inner.to_value())].into_iter().collect(),
            ),
            Self::Field { path, predicate } => {
                let body = match predicate {
                    FieldPredicate::Eq(v) if !v.is_object() => v.clone(),
                    FieldPredicate::Eq(v) => {
                        Value::Object([("$eq".to_string(), v.clone())].into_iter().collect())
                    }
                    FieldPredicate::Ne(v) => op_object("$ne", v.clone()),
                    FieldPredicate::Gt(v) => op_object("$gt", v.clone()),
                    FieldPredicate::Gte(v) => op_object("$gte", v.clone()),
                    FieldPredicate::Lt(v) => op_object("$lt", v.clone()),
                    FieldPredicate::Lte(v) => op_object("$lte", v.clone()),
                    FieldPredicate::In(vs) => op_object("$in", Value::Array(vs.clone())),
                    FieldPredicate::Nin(vs) => op_object("$nin", Value::Array(vs.clone())),
                    FieldPredicate::Regex(p) => op_object("$regex", Value::String(p.clone())),
                    FieldPredicate::Exists(b) => op_object("$exists", Value::Bool(*b)),
                };
                Value::Object([(path.clone(), body)].into_iter().collect())
            }
            Self::Text { search } => Value::Object(
                [(
                    "$text".to_string(),
                    Value::Object([("$search".to_string(), Value::String(search.clone()))].into_iter().collect()),
                )]
                .into_iter()
                .collect(),
            ),
            Self::Vector(v) => {
                let mut body = Map::new();
                body.insert("query".into(), Value::Array(v.query.iter().copied().map(Value::from).collect()));
                body.insert("field".into(), Value::String(v.field.clone()));
                body.insert("topK".into(), Value::from(v.top_k as u64));
                Value::Object([("$vector".to_string(), Value::Object(body))].into_iter().collect())
            }
        }
    }
}

fn op_object(op: &str, value: Value) -> Value {
    Value::Object([(op.to_string(), value)].into_iter().collect())
}

/// Inclusive/exclusive range bound extracted from ordered predicates.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeBound {
    pub value: Value,
    pub inclusive: bool,
}

impl Filter {
    /// The single value this filter pins `path` to by equality, when the
    /// predicate sits in the top-level conjunction.
    #[must_use]
    pub fn pinned_value(&self, path: &str) -> Option<&Value> {
        self.conjunction_terms().into_iter().find_map(|term| match term {
            Self::Field { path: p, predicate: FieldPredicate::Eq(v) } if p == path => Some(v),
            _ => None,
        })
    }

    /// The candidate set for `path`: a single value for equality, the value
    /// list for `$in`. `None` when the field is not pinned.
    #[must_use]
    pub fn pinned_set(&self, path: &str) -> Option<Vec<&Value>> {
        self.conjunction_terms().into_iter().find_map(|term| match term {
            Self::Field { path: p, predicate } if p == path => match predicate {
                FieldPredicate::Eq(v) => Some(vec![v]),
                FieldPredicate::In(vs) => Some(vs.iter().collect()),
                _ => None,
            },
            _ => None,
        })
    }

    /// Lower/upper bounds on `path` from top-level ordered predicates (and
    /// equality, which pins both bounds).
    #[must_use]
    pub fn range_bounds(&self, path: &str) -> (Option<RangeBound>, Option<RangeBound>) {
        let mut lower: Option<RangeBound> = None;
        let mut upper: Option<RangeBound> = None;
        for term in self.conjunction_terms() {
            let Self::Field { path: p, predicate } = term else { continue };
            if p != path {
                continue;
            }
            match predicate {
                FieldPredicate::Eq(v) => {
                    lower = Some(RangeBound { value: v.clone(), inclusive: true });
                    upper = Some(RangeBound { value: v.clone(), inclusive: true });
                }
                FieldPredicate::Gt(v) => {
                    lower = Some(RangeBound { value: v.clone(), inclusive: false });
                }
                FieldPredicate::Gte(v) => {
                    lower = Some(RangeBound { value: v.clone(), inclusive: true });
                }
                FieldPredicate::Lt(v) => {
                    upper = Some(RangeBound { value: v.clone(), inclusive: false });
                }
                FieldPredicate::Lte(v) => {
                    upper = Some(RangeBound { value: v.clone(), inclusive: true });
                }
                _ => {}
            }
        }
        (lower, upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_scalar_is_implicit_equality() {
        let filter = Filter::parse(&json!({"status": "active"})).unwrap();
        assert_eq!(
            filter,
            Filter::Field {
                path: "status".into(),
                predicate: FieldPredicate::Eq(json!("active")),
            }
        );
    }

    #[test]
    fn test_parse_multi_operator_field() {
        let filter = Filter::parse(&json!({"age": {"$gte": 18, "$lt": 65}})).unwrap();
        let Filter::And(terms) = filter else {
            panic!("expected conjunction");
        };
        assert_eq!(terms.len(), 2);
    }

    #[test]
    fn test_parse_rejects_unknown_operator() {
        assert!(Filter::parse(&json!({"$near": {}})).is_err());
        assert!(Filter::parse(&json!({"age": {"$between": [1, 2]}})).is_err());
    }

    #[test]
    fn test_parse_text_and_vector_roots() {
        let filter = Filter::parse(&json!({"$text": {"$search": "rust database"}})).unwrap();
        assert_eq!(filter, Filter::Text { search: "rust database".into() });

        let filter = Filter::parse(&json!({
            "$vector": {"query": [0.1, 0.2], "field": "embedding", "topK": 5}
        }))
        .unwrap();
        let Filter::Vector(v) = filter else { panic!("expected vector") };
        assert_eq!(v.field, "embedding");
        assert_eq!(v.top_k, 5);
    }

    #[test]
    fn test_normalize_flattens_nested_conjunctions() {
        let filter = Filter::parse(&json!({
            "$and": [
                {"a": 1},
                {"$and": [{"b": 2}, {"c": 3}]}
            ]
        }))
        .unwrap()
        .normalize();

        let Filter::And(terms) = filter else { panic!("expected conjunction") };
        assert_eq!(terms.len(), 3);
    }

    #[test]
    fn test_normalize_unwraps_singletons() {
        let filter = Filter::parse(&json!({"$and": [{"a": 1}]})).unwrap().normalize();
        assert!(matches!(filter, Filter::Field { .. }));

        let filter = Filter::parse(&json!({"$or": [{"a": 1}]})).unwrap().normalize();
        assert!(matches!(filter, Filter::Field { .. }));
    }

    #[test]
    fn test_to_value_round_trip() {
        let raw = json!({"status": "active", "age": {"$gte": 18, "$lt": 65}});
        let filter = Filter::parse(&raw).unwrap();
        let back = filter.to_value();
        assert_eq!(back["status"], json!("active"));
        assert_eq!(back["age"]["$gte"], json!(18));
        assert_eq!(back["age"]["$lt"], json!(65));
    }

    #[test]
    fn test_or_survives_to_value() {
        let filter = Filter::parse(&json!({"$or": [{"a": 1}, {"b": 2}]})).unwrap();
        let back = filter.to_value();
        assert!(back.get("$or").is_some());
    }
}
