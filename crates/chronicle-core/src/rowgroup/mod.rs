//! Columnar row groups.
//!
//! Flushed entity rows are stored column-wise in immutable row groups. Each
//! group carries per-column statistics (min, max, null count, bloom filter)
//! that let the query engine skip whole groups without decoding them.

pub mod bloom;
pub mod codec;
pub mod io;

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ChronicleError, DbResult};
use crate::filter::FieldPredicate;
use crate::model::Entity;

pub use bloom::BloomFilter;
pub use codec::{DataFile, DecodedRowGroup};

/// Distinct-count tracking gives up beyond this many values per column.
const DISTINCT_TRACKING_CAP: usize = 8_192;

/// Scalar boundary value recorded in column statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarStat {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ScalarStat {
    /// Scalar view of a JSON value; arrays/objects/nulls have no scalar form.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    /// Comparison within a family; `None` across families (unsound to order).
    #[must_use]
    pub fn partial_compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Int(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            (Self::Float(a), Self::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Stable bloom key. Integral floats share the integer encoding so `1`
    /// and `1.0` probe the same bits.
    #[must_use]
    pub fn bloom_key(&self) -> Vec<u8> {
        match self {
            Self::Bool(b) => format!("b:{b}").into_bytes(),
            Self::Int(i) => format!("i:{i}").into_bytes(),
            Self::Float(f) if f.fract() == 0.0 && f.is_finite() => {
                format!("i:{}", *f as i64).into_bytes()
            }
            Self::Float(f) => format!("f:{}", f.to_bits()).into_bytes(),
            Self::Str(s) => {
                let mut key = Vec::with_capacity(s.len() + 2);
                key.extend_from_slice(b"s:");
                key.extend_from_slice(s.as_bytes());
                key
            }
        }
    }

    const fn family(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Int(_) | Self::Float(_) => 1,
            Self::Str(_) => 2,
        }
    }
}

/// One cell of a column chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    /// Field absent from the row.
    Missing,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Nested array/object, pre-encoded as JSON bytes.
    Json(Vec<u8>),
}

impl CellValue {
    fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or(Self::Null),
            Value::String(s) => Self::Str(s.clone()),
            nested => Self::Json(serde_json::to_vec(nested).unwrap_or_default()),
        }
    }

    fn to_json(&self) -> DbResult<Option<Value>> {
        Ok(match self {
            Self::Missing => None,
            Self::Null => Some(Value::Null),
            Self::Bool(b) => Some(Value::Bool(*b)),
            Self::Int(i) => Some(Value::from(*i)),
            Self::Float(f) => Some(serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number)),
            Self::Str(s) => Some(Value::String(s.clone())),
            Self::Json(bytes) => Some(serde_json::from_slice(bytes).map_err(|e| {
                ChronicleError::internal(format!("corrupt nested cell: {e}"))
            })?),
        })
    }

    fn scalar(&self) -> Option<ScalarStat> {
        match self {
            Self::Bool(b) => Some(ScalarStat::Bool(*b)),
            Self::Int(i) => Some(ScalarStat::Int(*i)),
            Self::Float(f) => Some(ScalarStat::Float(*f)),
            Self::Str(s) => Some(ScalarStat::Str(s.clone())),
            _ => None,
        }
    }
}

/// One column of a row group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnChunk {
    pub name: String,
    pub cells: Vec<CellValue>,
}

/// Per-column statistics recorded in row-group metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub name: String,
    pub min: Option<ScalarStat>,
    pub max: Option<ScalarStat>,
    /// Missing and explicit-null cells.
    pub null_count: u64,
    pub distinct_estimate: Option<u64>,
    pub bloom: Option<BloomFilter>,
}

impl ColumnStats {
    fn build(chunk: &ColumnChunk) -> Self {
        let mut min: Option<ScalarStat> = None;
        let mut max: Option<ScalarStat> = None;
        let mut null_count = 0u64;
        let mut mixed_families = false;
        let mut family: Option<u8> = None;
        let mut distinct: HashSet<Vec<u8>> = HashSet::new();
        let mut bloom = BloomFilter::with_capacity(chunk.cells.len());

        for cell in &chunk.cells {
            match cell.scalar() {
                Some(scalar) => {
                    match family {
                        None => family = Some(scalar.family()),
                        Some(f) if f != scalar.family() => mixed_families = true,
                        Some(_) => {}
                    }
                    let key = scalar.bloom_key();
                    bloom.insert(&key);
                    if distinct.len() < DISTINCT_TRACKING_CAP {
                        distinct.insert(key);
                    }
                    min = Some(match min.take() {
                        None => scalar.clone(),
                        Some(current) => match current.partial_compare(&scalar) {
                            Some(Ordering::Greater) => scalar.clone(),
                            _ => current,
                        },
                    });
                    max = Some(match max.take() {
                        None => scalar,
                        Some(current) => match current.partial_compare(&scalar) {
                            Some(Ordering::Less) => scalar,
                            _ => current,
                        },
                    });
                }
                None => {
                    if matches!(cell, CellValue::Missing | CellValue::Null) {
                        null_count += 1;
                    }
                }
            }
        }

        // Min/max over mixed type families would be unsound for skipping.
        if mixed_families {
            min = None;
            max = None;
        }

        let distinct_estimate = if distinct.len() < DISTINCT_TRACKING_CAP {
            Some(distinct.len() as u64)
        } else {
            None
        };

        Self {
            name: chunk.name.clone(),
            min,
            max,
            null_count,
            distinct_estimate,
            bloom: Some(bloom),
        }
    }

    /// Whether the statistics prove no cell can satisfy the predicate.
    #[must_use]
    pub fn excludes(&self, predicate: &FieldPredicate, row_count: u64) -> bool {
        let all_null = self.null_count >= row_count;
        match predicate {
            FieldPredicate::Eq(value) => {
                if all_null {
                    return true;
                }
                let Some(scalar) = ScalarStat::from_value(value) else { return false };
                if self.min_max_exclude(&scalar, true, true) {
                    return true;
                }
                self.bloom
                    .as_ref()
                    .is_some_and(|b| !b.contains(&scalar.bloom_key()))
            }
            FieldPredicate::In(values) => {
                !values.is_empty()
                    && values
                        .iter()
                        .all(|v| self.excludes(&FieldPredicate::Eq(v.clone()), row_count))
            }
            FieldPredicate::Gt(value) => self.order_excludes(value, row_count, |ord, _| {
                // max <= value: nothing can be greater.
                matches!(ord, Ordering::Less | Ordering::Equal)
            }, true),
            FieldPredicate::Gte(value) => self.order_excludes(value, row_count, |ord, _| {
                matches!(ord, Ordering::Less)
            }, true),
            FieldPredicate::Lt(value) => self.order_excludes(value, row_count, |ord, _| {
                // min >= value: nothing can be smaller.
                matches!(ord, Ordering::Greater | Ordering::Equal)
            }, false),
            FieldPredicate::Lte(value) => self.order_excludes(value, row_count, |ord, _| {
                matches!(ord, Ordering::Greater)
            }, false),
            _ => false,
        }
    }

    fn min_max_exclude(&self, scalar: &ScalarStat, check_low: bool, check_high: bool) -> bool {
        if check_low {
            if let Some(min) = &self.min {
                if min.partial_compare(scalar) == Some(Ordering::Greater) {
                    return true;
                }
            }
        }
        if check_high {
            if let Some(max) = &self.max {
                if max.partial_compare(scalar) == Some(Ordering::Less) {
                    return true;
                }
            }
        }
        false
    }

    fn order_excludes(
        &self,
        value: &Value,
        row_count: u64,
        verdict: impl Fn(Ordering, &ScalarStat) -> bool,
        use_max: bool,
    ) -> bool {
        if self.null_count >= row_count {
            return true;
        }
        let Some(scalar) = ScalarStat::from_value(value) else { return false };
        let boundary = if use_max { &self.max } else { &self.min };
        boundary
            .as_ref()
            .and_then(|b| b.partial_compare(&scalar))
            .is_some_and(|ord| verdict(ord, &scalar))
    }

    /// Approximate in-memory size, for cache accounting.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.name.len() + 64 + self.bloom.as_ref().map_or(0, BloomFilter::size_bytes)
    }
}

/// Metadata for one row group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowGroupMeta {
    /// ULID assigned at flush time; promotion is idempotent on this id.
    pub group_id: String,
    pub row_count: u64,
    /// Event sequence range covered by this group.
    pub first_seq: u64,
    pub last_seq: u64,
    pub columns: Vec<ColumnStats>,
    /// Optional precomputed selectivity hint in [0, 1].
    pub selectivity_hint: Option<f64>,
}

impl RowGroupMeta {
    /// Statistics for a named column, when the group has any.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnStats> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether the group can be skipped for a pushed predicate on `column`.
    ///
    /// A column absent from the group means no row carries the field, which
    /// excludes every value-requiring predicate.
    #[must_use]
    pub fn skippable(&self, column: &str, predicate: &FieldPredicate) -> bool {
        match self.column(column) {
            Some(stats) => stats.excludes(predicate, self.row_count),
            None => matches!(
                predicate,
                FieldPredicate::Eq(_)
                    | FieldPredicate::In(_)
                    | FieldPredicate::Gt(_)
                    | FieldPredicate::Gte(_)
                    | FieldPredicate::Lt(_)
                    | FieldPredicate::Lte(_)
            ),
        }
    }
}

/// A fully materialized row group: metadata plus column chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowGroup {
    pub meta: RowGroupMeta,
    pub columns: Vec<ColumnChunk>,
}

impl RowGroup {
    /// Build a row group (with statistics) from entity snapshots.
    #[must_use]
    pub fn from_entities(
        group_id: String,
        first_seq: u64,
        last_seq: u64,
        entities: &[Entity],
    ) -> Self {
        let documents: Vec<Map<String, Value>> = entities
            .iter()
            .map(|e| match e.to_document() {
                Value::Object(map) => map,
                _ => Map::new(),
            })
            .collect();

        let mut names: BTreeSet<String> = BTreeSet::new();
        for doc in &documents {
            names.extend(doc.keys().cloned());
        }

        let columns: Vec<ColumnChunk> = names
            .into_iter()
            .map(|name| {
                let cells = documents
                    .iter()
                    .map(|doc| doc.get(&name).map_or(CellValue::Missing, CellValue::from_json))
                    .collect();
                ColumnChunk { name, cells }
            })
            .collect();

        let stats = columns.iter().map(ColumnStats::build).collect();
        Self {
            meta: RowGroupMeta {
                group_id,
                row_count: documents.len() as u64,
                first_seq,
                last_seq,
                columns: stats,
                selectivity_hint: None,
            },
            columns,
        }
    }

    /// Reassemble the document for row `index`.
    ///
    /// # Errors
    ///
    /// Fails on corrupt nested cells.
    pub fn row_document(&self, index: usize) -> DbResult<Map<String, Value>> {
        let mut doc = Map::new();
        for chunk in &self.columns {
            let cell = chunk.cells.get(index).unwrap_or(&CellValue::Missing);
            if let Some(value) = cell.to_json()? {
                doc.insert(chunk.name.clone(), value);
            }
        }
        Ok(doc)
    }

    /// Reassemble all rows as entities.
    ///
    /// # Errors
    ///
    /// Fails when a row is not a valid entity document.
    pub fn entities(&self) -> DbResult<Vec<Entity>> {
        (0..self.meta.row_count as usize)
            .map(|i| {
                let doc = self.row_document(i)?;
                Entity::from_document(&Value::Object(doc))
            })
            .collect()
    }

    /// Approximate in-memory size, for cache accounting.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        let cells: usize = self
            .columns
            .iter()
            .map(|c| {
                c.name.len()
                    + c.cells
                        .iter()
                        .map(|cell| match cell {
                            CellValue::Str(s) => s.len() + 8,
                            CellValue::Json(b) => b.len() + 8,
                            _ => 9,
                        })
                        .sum::<usize>()
            })
            .sum();
        cells + self.meta.columns.iter().map(ColumnStats::size_bytes).sum::<usize>()
    }
}
