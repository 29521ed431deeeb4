//! Model pricing lookup (collaborator contract).
//!
//! Consumers that meter third-party model usage resolve per-model costs
//! here. Lookup normalizes date suffixes (`-YYYY`, `-YYYYMMDD`) before
//! falling back, and explicit overrides always win over API refreshes.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Per-1K-token pricing for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Pricing table with override precedence.
#[derive(Debug, Clone, Default)]
pub struct PricingService {
    table: Arc<RwLock<HashMap<String, ModelPricing>>>,
    overrides: Arc<RwLock<HashMap<String, ModelPricing>>>,
}

impl PricingService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the base table (an API refresh). Overrides are untouched.
    pub async fn refresh_table(&self, table: HashMap<String, ModelPricing>) {
        *self.table.write().await = table;
    }

    /// Pin a price for one model; wins over any refresh.
    pub async fn set_override(&self, model: &str, pricing: ModelPricing) {
        self.overrides.write().await.insert(model.to_string(), pricing);
    }

    pub async fn clear_overrides(&self) {
        self.overrides.write().await.clear();
    }

    /// Price for a model: overrides first (exact, then date-normalized),
    /// then the base table (exact, then date-normalized).
    pub async fn lookup(&self, model: &str) -> Option<ModelPricing> {
        let normalized = normalize_model_name(model);
        let overrides = self.overrides.read().await;
        if let Some(hit) = overrides.get(model).or_else(|| overrides.get(&normalized)) {
            return Some(*hit);
        }
        drop(overrides);
        let table = self.table.read().await;
        table.get(model).or_else(|| table.get(&normalized)).copied()
    }
}

/// Strip a trailing date suffix: `-YYYYMMDD` first, then `-YYYY`.
#[must_use]
pub fn normalize_model_name(model: &str) -> String {
    // Compiled per call; lookup volume is tiny.
    let date8 = Regex::new(r"-\d{8}$");
    let date4 = Regex::new(r"-\d{4}$");
    if let Ok(re) = date8 {
        if re.is_match(model) {
            return re.replace(model, "").into_owned();
        }
    }
    if let Ok(re) = date4 {
        if re.is_match(model) {
            return re.replace(model, "").into_owned();
        }
    }
    model.to_string()
}
