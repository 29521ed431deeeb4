//! Tokenized inverted index for `$text` search.

use std::collections::{HashMap, HashSet};

use crate::model::EntityId;

/// Lowercased alphanumeric tokens, deduplicated, in first-seen order.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut tokens = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        if raw.is_empty() {
            continue;
        }
        let token = raw.to_lowercase();
        if seen.insert(token.clone()) {
            tokens.push(token);
        }
    }
    tokens
}

/// Inverted index: token -> posting set, with per-document token lists for
/// removal and scoring.
#[derive(Debug, Default)]
pub struct InvertedIndex {
    postings: HashMap<String, HashSet<EntityId>>,
    documents: HashMap<EntityId, Vec<String>>,
}

impl InvertedIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index (or re-index) a document's searchable text.
    pub fn insert(&mut self, id: EntityId, text: &str) {
        self.remove(&id);
        let tokens = tokenize(text);
        for token in &tokens {
            self.postings.entry(token.clone()).or_default().insert(id.clone());
        }
        self.documents.insert(id, tokens);
    }

    pub fn remove(&mut self, id: &EntityId) {
        if let Some(tokens) = self.documents.remove(id) {
            for token in tokens {
                if let Some(posting) = self.postings.get_mut(&token) {
                    posting.remove(id);
                    if posting.is_empty() {
                        self.postings.remove(&token);
                    }
                }
            }
        }
    }

    /// Posting-list size for the rarest token of a query; the upper bound on
    /// result size used for cost estimation.
    #[must_use]
    pub fn estimate(&self, query: &str) -> u64 {
        tokenize(query)
            .iter()
            .map(|t| self.postings.get(t).map_or(0, HashSet::len) as u64)
            .min()
            .unwrap_or(0)
    }

    /// Conjunctive search: documents containing every query token, ranked by
    /// the fraction of their tokens that match (then id for determinism).
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<(EntityId, f64)> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        // Intersect postings, starting from the rarest token.
        let mut ordered: Vec<&String> = tokens.iter().collect();
        ordered.sort_by_key(|t| self.postings.get(*t).map_or(0, HashSet::len));

        let mut candidates: Option<HashSet<EntityId>> = None;
        for token in ordered {
            let Some(posting) = self.postings.get(token) else { return Vec::new() };
            candidates = Some(match candidates {
                None => posting.clone(),
                Some(current) => current.intersection(posting).cloned().collect(),
            });
            if candidates.as_ref().is_some_and(HashSet::is_empty) {
                return Vec::new();
            }
        }

        let mut scored: Vec<(EntityId, f64)> = candidates
            .unwrap_or_default()
            .into_iter()
            .map(|id| {
                let doc_len = self.documents.get(&id).map_or(1, Vec::len).max(1);
                let score = tokens.len() as f64 / doc_len as f64;
                (id, score)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored
    }

    #[must_use]
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }
}
