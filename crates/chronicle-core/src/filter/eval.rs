//! Row-level filter evaluation against entity snapshots.

use std::cmp::Ordering;

use serde_json::Value;

use crate::model::value::{compare_values, values_equal};
use crate::model::Entity;

use super::{FieldPredicate, Filter};

impl Filter {
    /// Evaluate the filter against an entity snapshot.
    ///
    /// `$text` falls back to a token scan over string fields when no index is
    /// involved; `$vector` always matches here because ranking is the
    /// executor's job (the index hands back an ordered id stream).
    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Self::True => true,
            Self::And(terms) => terms.iter().all(|t| t.matches(entity)),
            Self::Or(terms) => terms.iter().any(|t| t.matches(entity)),
            Self::Not(inner) => !inner.matches(entity),
            Self::Field { path, predicate } => {
                predicate_matches(predicate, entity.field(path).as_ref())
            }
            Self::Text { search } => text_matches(entity, search),
            Self::Vector(_) => true,
        }
    }
}

fn predicate_matches(predicate: &FieldPredicate, field: Option<&Value>) -> bool {
    match predicate {
        FieldPredicate::Exists(expected) => field.is_some() == *expected,
        // Negated predicates match missing fields.
        FieldPredicate::Ne(value) => field.is_none_or(|f| !values_equal(f, value)),
        FieldPredicate::Nin(values) => {
            field.is_none_or(|f| !values.iter().any(|v| values_equal(f, v)))
        }
        _ => {
            let Some(field) = field else { return false };
            match predicate {
                FieldPredicate::Eq(value) => values_equal(field, value),
                FieldPredicate::In(values) => values.iter().any(|v| values_equal(field, v)),
                FieldPredicate::Gt(value) => ordered(field, value, &[Ordering::Greater]),
                FieldPredicate::Gte(value) => {
                    ordered(field, value, &[Ordering::Greater, Ordering::Equal])
                }
                FieldPredicate::Lt(value) => ordered(field, value, &[Ordering::Less]),
                FieldPredicate::Lte(value) => {
                    ordered(field, value, &[Ordering::Less, Ordering::Equal])
                }
                FieldPredicate::Regex(pattern) => match field.as_str() {
                    Some(s) => regex::Regex::new(pattern).map(|re| re.is_match(s)).unwrap_or(false),
                    None => false,
                },
                FieldPredicate::Exists(_) | FieldPredicate::Ne(_) | FieldPredicate::Nin(_) => {
                    // Handled above.
                    false
                }
            }
        }
    }
}

fn ordered(field: &Value, value: &Value, accepted: &[Ordering]) -> bool {
    // Ordered comparators only apply within a comparable type family.
    let comparable = matches!(
        (field, value),
        (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_))
    );
    comparable && accepted.contains(&compare_values(field, value))
}

/// Naive full-text fallback: every search token must appear in some string
/// field of the document (case-insensitive).
fn text_matches(entity: &Entity, search: &str) -> bool {
    let tokens: Vec<String> = crate::index::text::tokenize(search);
    if tokens.is_empty() {
        return true;
    }
    let mut haystack = String::new();
    collect_strings(&Value::Object(entity.data.clone()), &mut haystack);
    haystack.push(' ');
    haystack.push_str(&entity.entity_type);
    let haystack = haystack.to_lowercase();
    tokens.iter().all(|t| haystack.contains(t.as_str()))
}

fn collect_strings(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push(' ');
            out.push_str(s);
        }
        Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}
