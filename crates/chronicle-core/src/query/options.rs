//! Query and write options.

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{ChronicleError, DbResult};

/// Sort direction, `1` / `-1` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Projection: include-mode keeps the listed fields, exclude-mode drops
/// them. Core fields are always present either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl Projection {
    /// Parse the wire form: a map of field -> 1/0.
    ///
    /// # Errors
    ///
    /// Rejects mixed include/exclude maps and non-0/1 values.
    pub fn from_value(raw: &Value) -> DbResult<Self> {
        let map = raw
            .as_object()
            .ok_or_else(|| ChronicleError::validation("project must be an object"))?;
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for (field, flag) in map {
            match flag.as_i64() {
                Some(1) => include.push(field.clone()),
                Some(0) => exclude.push(field.clone()),
                _ => {
                    return Err(ChronicleError::validation(format!(
                        "projection flag for '{field}' must be 0 or 1"
                    )))
                }
            }
        }
        match (include.is_empty(), exclude.is_empty()) {
            (false, true) => Ok(Self::Include(include)),
            (true, false) => Ok(Self::Exclude(exclude)),
            (true, true) => Err(ChronicleError::validation("empty projection")),
            (false, false) => Err(ChronicleError::validation(
                "projection cannot mix include and exclude",
            )),
        }
    }

    /// Fields referenced by the projection.
    #[must_use]
    pub fn fields(&self) -> &[String] {
        match self {
            Self::Include(fields) | Self::Exclude(fields) => fields,
        }
    }
}

/// Options accepted by every read operation.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    /// Opaque pagination token; mutually exclusive with `skip`.
    pub cursor: Option<String>,
    pub sort: Vec<(String, SortDirection)>,
    pub project: Option<Projection>,
    /// Edge predicates to expand inline on each result.
    pub hydrate: Vec<String>,
    pub actor: Option<String>,
    /// Read the state as of this sequence number (point-in-time get).
    pub at_seq: Option<u64>,
    /// Include tombstoned entities.
    pub include_deleted: bool,
    /// Cancellation signal, observed at suspension points.
    pub cancel: Option<CancellationToken>,
}

impl QueryOptions {
    /// Parse the wire form.
    ///
    /// # Errors
    ///
    /// Rejects malformed option values.
    pub fn from_value(raw: &Value) -> DbResult<Self> {
        let map = raw
            .as_object()
            .ok_or_else(|| ChronicleError::validation("options must be an object"))?;
        let mut options = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "limit" => {
                    options.limit = Some(value.as_u64().ok_or_else(|| {
                        ChronicleError::validation("limit must be a non-negative integer")
                    })? as usize);
                }
                "skip" => {
                    options.skip = Some(value.as_u64().ok_or_else(|| {
                        ChronicleError::validation("skip must be a non-negative integer")
                    })? as usize);
                }
                "cursor" => {
                    options.cursor = Some(
                        value
                            .as_str()
                            .ok_or_else(|| ChronicleError::validation("cursor must be a string"))?
                            .to_string(),
                    );
                }
                "sort" => options.sort = parse_sort(value)?,
                "project" => options.project = Some(Projection::from_value(value)?),
                "hydrate" => {
                    let items = value.as_array().ok_or_else(|| {
                        ChronicleError::validation("hydrate must be an array of predicates")
                    })?;
                    options.hydrate = items
                        .iter()
                        .map(|v| {
                            v.as_str().map(str::to_string).ok_or_else(|| {
                                ChronicleError::validation("hydrate entries must be strings")
                            })
                        })
                        .collect::<DbResult<Vec<String>>>()?;
                }
                "actor" => {
                    options.actor = value.as_str().map(str::to_string);
                }
                "includeDeleted" => {
                    options.include_deleted = value.as_bool().unwrap_or(false);
                }
                other => {
                    return Err(ChronicleError::validation(format!(
                        "unknown query option '{other}'"
                    )))
                }
            }
        }
        Ok(options)
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_sort(mut self, field: &str, direction: SortDirection) -> Self {
        self.sort.push((field.to_string(), direction));
        self
    }

    /// Cancellation check used at suspension points.
    ///
    /// # Errors
    ///
    /// Returns `CANCELLED` when the token has been triggered.
    pub fn check_cancelled(&self) -> DbResult<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => {
                Err(ChronicleError::cancelled("query cancelled"))
            }
            _ => Ok(()),
        }
    }
}

/// Sort specs arrive as `{field: ±1}` maps or `[[field, ±1], ...]` arrays
/// (the array form preserves multi-key order).
fn parse_sort(raw: &Value) -> DbResult<Vec<(String, SortDirection)>> {
    let dir = |v: &Value| match v.as_i64() {
        Some(1) => Ok(SortDirection::Asc),
        Some(-1) => Ok(SortDirection::Desc),
        _ => Err(ChronicleError::validation("sort direction must be 1 or -1")),
    };

    match raw {
        Value::Object(map) => map
            .iter()
            .map(|(field, v)| Ok((field.clone(), dir(v)?)))
            .collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                let pair = item
                    .as_array()
                    .filter(|p| p.len() == 2)
                    .ok_or_else(|| ChronicleError::validation("sort entries must be [field, ±1]"))?;
                let field = pair[0]
                    .as_str()
                    .ok_or_else(|| ChronicleError::validation("sort field must be a string"))?;
                Ok((field.to_string(), dir(&pair[1])?))
            })
            .collect(),
        _ => Err(ChronicleError::validation("sort must be an object or array")),
    }
}

/// Options accepted by every mutation.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Opaque principal recorded on the event and audit fields.
    pub actor: Option<String>,
    /// Free-form metadata attached to the event.
    pub metadata: Option<Map<String, Value>>,
    /// Cancellation signal; honored only before the sequence number is
    /// consumed.
    pub cancel: Option<CancellationToken>,
}

impl WriteOptions {
    #[must_use]
    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }

    /// Effective actor, defaulting to `"system"`.
    #[must_use]
    pub fn actor_or_default(&self) -> String {
        self.actor.clone().unwrap_or_else(|| "system".to_string())
    }

    /// Cancellation check, valid only before sequence allocation.
    ///
    /// # Errors
    ///
    /// Returns `CANCELLED` when the token has been triggered.
    pub fn check_cancelled(&self) -> DbResult<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => {
                Err(ChronicleError::cancelled("write cancelled"))
            }
            _ => Ok(()),
        }
    }
}

/// Opaque pagination cursor: base64 of the next offset.
pub mod cursor {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use serde::{Deserialize, Serialize};

    use crate::error::{ChronicleError, DbResult};

    #[derive(Serialize, Deserialize)]
    struct CursorToken {
        o: usize,
    }

    /// Encode a cursor pointing just past the last returned row.
    #[must_use]
    pub fn encode(offset: usize) -> String {
        let token = CursorToken { o: offset };
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&token).unwrap_or_default())
    }

    /// Decode a cursor.
    ///
    /// # Errors
    ///
    /// Rejects tokens that are not valid cursors.
    pub fn decode(cursor: &str) -> DbResult<usize> {
        let bytes = URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|_| ChronicleError::validation("malformed cursor"))?;
        let token: CursorToken = serde_json::from_slice(&bytes)
            .map_err(|_| ChronicleError::validation("malformed cursor"))?;
        Ok(token.o)
    }
}
