//! JSON value helpers shared by the filter language, indexes, and sorting.
//!
//! Documents are open maps of `String -> serde_json::Value`. Comparisons over
//! heterogeneous values use a total order so sorts and range predicates are
//! deterministic: Null < Bool < Number < String < Array < Object.

use std::cmp::Ordering;

use serde_json::Value;

/// Rank of a JSON value's type in the total order.
const fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let fx = x.as_f64().unwrap_or(f64::NAN);
            let fy = y.as_f64().unwrap_or(f64::NAN);
            fx.partial_cmp(&fy).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let ord = compare_values(ex, ey);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            // Objects compare by serialized form; rare in sort keys.
            let sx = Value::Object(x.clone()).to_string();
            let sy = Value::Object(y.clone()).to_string();
            sx.cmp(&sy)
        }
        _ => Ordering::Equal,
    }
}

/// Semantic equality: numbers compare numerically (`1` equals `1.0`).
#[must_use]
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().map(f64::to_bits) == y.as_f64().map(f64::to_bits) || x == y
        }
        _ => a == b,
    }
}

/// Look up a dotted field path (`"profile.city"`) inside a document.
///
/// Returns `None` when any segment is missing or traverses a non-object.
#[must_use]
pub fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Set a dotted field path inside a document, creating intermediate objects.
pub fn set_path(doc: &mut serde_json::Map<String, Value>, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = doc;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(serde_json::Map::new());
        }
        match entry.as_object_mut() {
            Some(obj) => current = obj,
            None => return,
        }
    }
}

/// Remove a dotted field path from a document. Returns the removed value.
pub fn remove_path(doc: &mut serde_json::Map<String, Value>, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => doc.remove(path),
        Some((head, rest)) => remove_path(doc.get_mut(head)?.as_object_mut()?, rest),
    }
}

/// Approximate encoded size of a value in bytes, used for buffer accounting.
#[must_use]
pub fn approximate_size(value: &Value) -> usize {
    match value {
        Value::Null => 4,
        Value::Bool(_) => 5,
        Value::Number(_) => 8,
        Value::String(s) => s.len() + 2,
        Value::Array(items) => 2 + items.iter().map(approximate_size).sum::<usize>(),
        Value::Object(map) => {
            2 + map
                .iter()
                .map(|(k, v)| k.len() + 3 + approximate_size(v))
                .sum::<usize>()
        }
    }
}
