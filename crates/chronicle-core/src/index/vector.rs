//! Fixed-dimension vector index with top-k cosine similarity search.
//!
//! The scan is exact with a bounded k-best heap; the ordered-id-stream
//! interface is what the executor depends on, so an approximate structure
//! can replace the scan without touching callers.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::error::{ChronicleError, DbResult};
use crate::model::EntityId;

/// Vector index over one embedding field.
#[derive(Debug)]
pub struct VectorIndex {
    dims: usize,
    vectors: HashMap<EntityId, Vec<f32>>,
}

struct HeapEntry {
    similarity: f32,
    id: EntityId,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on similarity (then reversed id) via BinaryHeap's max-heap.
        other
            .similarity
            .total_cmp(&self.similarity)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl VectorIndex {
    #[must_use]
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            vectors: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn dims(&self) -> usize {
        self.dims
    }

    /// Insert or replace an embedding.
    ///
    /// # Errors
    ///
    /// Returns a validation error on a dimension mismatch.
    pub fn insert(&mut self, id: EntityId, vector: Vec<f32>) -> DbResult<()> {
        if vector.len() != self.dims {
            return Err(ChronicleError::validation(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dims,
                vector.len()
            )));
        }
        self.vectors.insert(id, vector);
        Ok(())
    }

    pub fn remove(&mut self, id: &EntityId) {
        self.vectors.remove(id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Top-k ids ranked by cosine similarity (descending), id-tiebroken.
    #[must_use]
    pub fn search(&self, query: &[f64], top_k: usize) -> Vec<(EntityId, f32)> {
        if top_k == 0 || query.len() != self.dims {
            return Vec::new();
        }
        let query: Vec<f32> = query.iter().map(|v| *v as f32).collect();
        let query_norm = norm(&query);
        if query_norm == 0.0 {
            return Vec::new();
        }

        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(top_k + 1);
        for (id, vector) in &self.vectors {
            let denom = query_norm * norm(vector);
            let similarity = if denom == 0.0 {
                0.0
            } else {
                dot(&query, vector) / denom
            };
            heap.push(HeapEntry {
                similarity,
                id: id.clone(),
            });
            if heap.len() > top_k {
                heap.pop();
            }
        }

        let mut results: Vec<(EntityId, f32)> =
            heap.into_iter().map(|e| (e.id, e.similarity)).collect();
        results.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        results
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}
