//! Namespace routing.
//!
//! Given a namespace and an optional filter, the router returns the ordered
//! set of data paths that may contain matching rows. Typed namespaces live in
//! a single flat file, flexible namespaces in a per-namespace directory, and
//! sharded namespaces fan out by discriminator value, time bucket, or hash.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Months, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::filter::Filter;
use crate::model::namespace_path_segment;
use crate::storage::ObjectMeta;

/// Storage mode of a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceMode {
    /// Schema known, one flat file: `data/<ns>.parquet`
    Typed,
    /// Schema-less or mixed, per-namespace directory: `data/<ns>/data.parquet`
    #[default]
    Flexible,
}

/// Bucket granularity for time sharding. Week buckets use ISO weeks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGranularity {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

/// Shard strategy declared on a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShardStrategy {
    /// Shard key is the value of a named field.
    Discriminator { field: String },
    /// Shard key is a timestamp field bucketed by granularity.
    TimeBucket { field: String, granularity: TimeGranularity },
    /// Shard key is the hash of an identifier field modulo a fixed count.
    Hash { field: String, shard_count: u32 },
}

/// Registered description of a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceSpec {
    pub name: String,
    pub mode: NamespaceMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardStrategy>,
    /// Shard values observed by flushes (discriminator / time strategies
    /// enumerate these when the filter does not pin the shard key).
    #[serde(default)]
    pub known_shards: Vec<String>,
}

impl NamespaceSpec {
    #[must_use]
    pub fn flexible(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mode: NamespaceMode::Flexible,
            shard: None,
            known_shards: Vec::new(),
        }
    }

    #[must_use]
    pub fn typed(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mode: NamespaceMode::Typed,
            shard: None,
            known_shards: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_shard(mut self, shard: ShardStrategy) -> Self {
        self.shard = Some(shard);
        self
    }
}

/// Growth thresholds that trigger sharding or compaction.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_file_bytes: u64,
    pub max_entities: u64,
    pub max_row_groups: usize,
    /// Upper bound on enumerated time buckets before falling back to the
    /// unsharded base path.
    pub max_enumerated_buckets: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 256 * 1024 * 1024,
            max_entities: 1_000_000,
            max_row_groups: 256,
            max_enumerated_buckets: 1_000,
        }
    }
}

/// Whether a data file exceeds growth thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrowthReport {
    pub exceeds_bytes: bool,
    pub exceeds_entities: bool,
    pub exceeds_row_groups: bool,
}

impl GrowthReport {
    #[must_use]
    pub const fn any(&self) -> bool {
        self.exceeds_bytes || self.exceeds_entities || self.exceeds_row_groups
    }
}

/// Namespace-to-path resolution.
pub struct Router {
    config: RouterConfig,
    specs: RwLock<std::collections::HashMap<String, NamespaceSpec>>,
}

impl Router {
    #[must_use]
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            specs: RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Register (or replace) a namespace spec.
    pub async fn register(&self, spec: NamespaceSpec) {
        let key = namespace_path_segment(&spec.name);
        self.specs.write().await.insert(key, spec);
    }

    /// Current spec for a namespace, defaulting to flexible when unknown.
    pub async fn spec(&self, namespace: &str) -> NamespaceSpec {
        let key = namespace_path_segment(namespace);
        self.specs
            .read()
            .await
            .get(&key)
            .cloned()
            .unwrap_or_else(|| NamespaceSpec::flexible(namespace))
    }

    /// All registered specs, for persistence.
    pub async fn specs(&self) -> Vec<NamespaceSpec> {
        self.specs.read().await.values().cloned().collect()
    }

    /// Record a shard value observed by a flush so unpinned filters can
    /// enumerate it later.
    pub async fn observe_shard(&self, namespace: &str, shard_value: &str) {
        let key = namespace_path_segment(namespace);
        let mut specs = self.specs.write().await;
        let spec = specs
            .entry(key)
            .or_insert_with(|| NamespaceSpec::flexible(namespace));
        if !spec.known_shards.iter().any(|s| s == shard_value) {
            spec.known_shards.push(shard_value.to_string());
            spec.known_shards.sort();
        }
    }

    /// The unsharded base path for a namespace.
    pub async fn base_path(&self, namespace: &str) -> String {
        let spec = self.spec(namespace).await;
        let ns = namespace_path_segment(namespace);
        match spec.mode {
            NamespaceMode::Typed => format!("data/{ns}.parquet"),
            NamespaceMode::Flexible => format!("data/{ns}/data.parquet"),
        }
    }

    /// Resolve the ordered set of data paths that may contain rows matching
    /// the filter. Soundness: every shard that could hold a matching row is
    /// included.
    pub async fn resolve_data_paths(&self, namespace: &str, filter: Option<&Filter>) -> Vec<String> {
        let spec = self.spec(namespace).await;
        let ns = namespace_path_segment(namespace);
        let base = match spec.mode {
            NamespaceMode::Typed => format!("data/{ns}.parquet"),
            NamespaceMode::Flexible => format!("data/{ns}/data.parquet"),
        };

        let Some(shard) = &spec.shard else {
            return vec![base];
        };

        let paths = match shard {
            ShardStrategy::Discriminator { field } => {
                self.resolve_discriminator(&ns, &spec, field, filter)
            }
            ShardStrategy::TimeBucket { field, granularity } => {
                self.resolve_time_bucket(&ns, &spec, field, *granularity, filter)
            }
            ShardStrategy::Hash { field, shard_count } => {
                Self::resolve_hash(&ns, field, *shard_count, filter)
            }
        };

        match paths {
            Some(paths) if !paths.is_empty() => paths,
            _ => {
                debug!(namespace, "shard resolution fell back to base path");
                vec![base]
            }
        }
    }

    fn resolve_discriminator(
        &self,
        ns: &str,
        spec: &NamespaceSpec,
        field: &str,
        filter: Option<&Filter>,
    ) -> Option<Vec<String>> {
        let pinned = filter.and_then(|f| f.pinned_set(field));
        match pinned {
            Some(values) => {
                // Every pinned value must map onto a known shard; otherwise
                // the base path is the only sound answer.
                let mut paths = Vec::with_capacity(values.len());
                for value in values {
                    let encoded = encode_shard_value(&scalar_label(value));
                    if !spec.known_shards.is_empty() && !spec.known_shards.contains(&encoded) {
                        return None;
                    }
                    paths.push(format!("{ns}/_shards/type={encoded}/data.parquet"));
                }
                paths.sort();
                paths.dedup();
                Some(paths)
            }
            None => Some(
                spec.known_shards
                    .iter()
                    .map(|v| format!("{ns}/_shards/type={v}/data.parquet"))
                    .collect(),
            ),
        }
    }

    fn resolve_time_bucket(
        &self,
        ns: &str,
        spec: &NamespaceSpec,
        field: &str,
        granularity: TimeGranularity,
        filter: Option<&Filter>,
    ) -> Option<Vec<String>> {
        let filter = filter?;

        if let Some(value) = filter.pinned_value(field) {
            let ts = parse_timestamp(value)?;
            let bucket = bucket_label(ts, granularity);
            return Some(vec![format!("{ns}/_shards/period={bucket}/data.parquet")]);
        }

        let (lower, upper) = filter.range_bounds(field);
        if let (Some(lower), Some(upper)) = (lower, upper) {
            let from = parse_timestamp(&lower.value)?;
            let to = parse_timestamp(&upper.value)?;
            let buckets = enumerate_buckets(from, to, granularity, self.config.max_enumerated_buckets)?;
            return Some(
                buckets
                    .into_iter()
                    .map(|b| format!("{ns}/_shards/period={b}/data.parquet"))
                    .collect(),
            );
        }

        // Unbounded: enumerate what flushes have produced so far.
        if spec.known_shards.is_empty() {
            None
        } else {
            Some(
                spec.known_shards
                    .iter()
                    .map(|v| format!("{ns}/_shards/period={v}/data.parquet"))
                    .collect(),
            )
        }
    }

    fn resolve_hash(
        ns: &str,
        field: &str,
        shard_count: u32,
        filter: Option<&Filter>,
    ) -> Option<Vec<String>> {
        let shard_count = shard_count.max(1);
        match filter.and_then(|f| f.pinned_value(field)) {
            Some(value) => {
                let shard = hash_shard(&scalar_label(value), shard_count);
                Some(vec![format!("{ns}/_shards/shard={shard}/data.parquet")])
            }
            None => Some(
                (0..shard_count)
                    .map(|n| format!("{ns}/_shards/shard={n}/data.parquet"))
                    .collect(),
            ),
        }
    }

    /// The single data path a given entity row belongs to, applying the
    /// namespace's shard strategy to the entity's own field values. Shard
    /// values resolved here are recorded as known shards.
    pub async fn path_for_entity(&self, namespace: &str, entity: &crate::model::Entity) -> String {
        let spec = self.spec(namespace).await;
        let ns = namespace_path_segment(namespace);
        let base = match spec.mode {
            NamespaceMode::Typed => format!("data/{ns}.parquet"),
            NamespaceMode::Flexible => format!("data/{ns}/data.parquet"),
        };

        let Some(shard) = &spec.shard else { return base };
        match shard {
            ShardStrategy::Discriminator { field } => match entity.field(field) {
                Some(value) => {
                    let encoded = encode_shard_value(&scalar_label(&value));
                    self.observe_shard(namespace, &encoded).await;
                    format!("{ns}/_shards/type={encoded}/data.parquet")
                }
                None => base,
            },
            ShardStrategy::TimeBucket { field, granularity } => {
                match entity.field(field).as_ref().and_then(parse_timestamp) {
                    Some(ts) => {
                        let bucket = bucket_label(ts, *granularity);
                        self.observe_shard(namespace, &bucket).await;
                        format!("{ns}/_shards/period={bucket}/data.parquet")
                    }
                    None => base,
                }
            }
            ShardStrategy::Hash { field, shard_count } => match entity.field(field) {
                Some(value) => {
                    let shard = hash_shard(&scalar_label(&value), *shard_count);
                    format!("{ns}/_shards/shard={shard}/data.parquet")
                }
                None => base,
            },
        }
    }

    /// Whether a file exceeds growth thresholds, so the facade can trigger
    /// sharding or compaction.
    #[must_use]
    pub fn check_growth(&self, meta: &ObjectMeta, entities: u64, row_groups: usize) -> GrowthReport {
        GrowthReport {
            exceeds_bytes: meta.size > self.config.max_file_bytes,
            exceeds_entities: entities > self.config.max_entities,
            exceeds_row_groups: row_groups > self.config.max_row_groups,
        }
    }
}

/// Stable path encoding of a shard value: lowercased, with non-alphanumerics
/// coerced to `_`.
#[must_use]
pub fn encode_shard_value(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Deterministic shard assignment: FNV-1a 64 modulo the shard count.
#[must_use]
pub fn hash_shard(value: &str, shard_count: u32) -> u32 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in value.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % u64::from(shard_count.max(1))) as u32
}

fn scalar_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Bucket label for a timestamp: `YYYY`, `YYYY-MM`, `YYYY-Www` (ISO week,
/// zero-padded), `YYYY-MM-DD`, or `YYYY-MM-DDTHH`.
#[must_use]
pub fn bucket_label(ts: DateTime<Utc>, granularity: TimeGranularity) -> String {
    match granularity {
        TimeGranularity::Year => ts.format("%Y").to_string(),
        TimeGranularity::Month => ts.format("%Y-%m").to_string(),
        TimeGranularity::Week => {
            let iso = ts.iso_week();
            format!("{}-W{:02}", iso.year(), iso.week())
        }
        TimeGranularity::Day => ts.format("%Y-%m-%d").to_string(),
        TimeGranularity::Hour => ts.format("%Y-%m-%dT%H").to_string(),
    }
}

/// Parse a filter value as a timestamp: RFC 3339, `YYYY-MM-DD`, or epoch
/// milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| Utc.from_utc_datetime(&dt))
            }),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Enumerate bucket labels covering `[from, to]` inclusively.
fn enumerate_buckets(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    granularity: TimeGranularity,
    cap: usize,
) -> Option<Vec<String>> {
    if to < from {
        return Some(Vec::new());
    }
    let mut buckets = Vec::new();
    let mut cursor = from;
    loop {
        let label = bucket_label(cursor, granularity);
        if buckets.last() != Some(&label) {
            buckets.push(label);
        }
        if buckets.len() > cap {
            return None;
        }
        if bucket_label(cursor, granularity) == bucket_label(to, granularity) {
            break;
        }
        cursor = match granularity {
            TimeGranularity::Hour => cursor + ChronoDuration::hours(1),
            TimeGranularity::Day => cursor + ChronoDuration::days(1),
            TimeGranularity::Week => cursor + ChronoDuration::weeks(1),
            TimeGranularity::Month => cursor.checked_add_months(Months::new(1))?,
            TimeGranularity::Year => cursor.checked_add_months(Months::new(12))?,
        };
        if cursor > to + ChronoDuration::days(400) {
            // Unreachable for aligned steps; bounds the loop regardless.
            break;
        }
    }
    Some(buckets)
}
