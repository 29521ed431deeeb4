//! Ordered, hashable index keys derived from JSON scalars.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// f64 wrapper with total order and consistent hashing. `-0.0` normalizes to
/// `0.0` so equal JSON numbers produce equal keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderedF64(f64);

impl OrderedF64 {
    #[must_use]
    pub fn new(value: f64) -> Self {
        Self(if value == 0.0 { 0.0 } else { value })
    }

    #[must_use]
    pub const fn get(self) -> f64 {
        self.0
    }
}

impl PartialEq for OrderedF64 {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for OrderedF64 {}

impl PartialOrd for OrderedF64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for OrderedF64 {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// Index key over a JSON scalar. Ordering: Null < Bool < Num < Str, matching
/// the engine's value total order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Num(OrderedF64),
    Str(String),
}

impl IndexKey {
    /// Key for a scalar value; arrays and objects have none.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Null),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_f64().map(|f| Self::Num(OrderedF64::new(f))),
            Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    /// Keys a field value contributes: one per element for arrays (multikey),
    /// one for scalars, none for objects.
    #[must_use]
    pub fn expand(value: &Value) -> Vec<Self> {
        match value {
            Value::Array(items) => items.iter().filter_map(Self::from_value).collect(),
            other => Self::from_value(other).into_iter().collect(),
        }
    }
}
