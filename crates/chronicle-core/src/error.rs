//! # Core Error Types
//!
//! Error handling for the ChronicleDB engine. Every failure that crosses the
//! public API boundary is a [`ChronicleError`] carrying an [`ErrorKind`] from
//! the boundary taxonomy, with an advisory HTTP status mapping that web
//! adapters may consume verbatim.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for engine operations
pub type DbResult<T> = Result<T, ChronicleError>;

/// Boundary error taxonomy.
///
/// The HTTP mapping is advisory from the core's perspective; validation,
/// not-found, and conflict kinds are surfaced to the caller unchanged and
/// are never retried inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    EntityNotFound,
    ValidationError,
    Conflict,
    VersionConflict,
    Unauthorized,
    PermissionDenied,
    CircuitOpen,
    PathTraversal,
    Cancelled,
    IoError,
    Internal,
}

impl ErrorKind {
    /// Canonical default HTTP status for this kind.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::NotFound | Self::EntityNotFound => 404,
            Self::ValidationError | Self::PathTraversal => 400,
            Self::Conflict | Self::VersionConflict => 409,
            Self::Unauthorized | Self::PermissionDenied => 403,
            Self::CircuitOpen => 503,
            Self::Cancelled => 499,
            Self::IoError => 502,
            Self::Internal => 500,
        }
    }

    /// Category label for metrics and logging.
    #[must_use]
    pub const fn category(self) -> &'static str {
        match self {
            Self::NotFound | Self::EntityNotFound => "not_found",
            Self::ValidationError => "validation",
            Self::Conflict | Self::VersionConflict => "conflict",
            Self::Unauthorized | Self::PermissionDenied => "auth",
            Self::CircuitOpen => "circuit",
            Self::PathTraversal => "path",
            Self::Cancelled => "cancelled",
            Self::IoError => "io",
            Self::Internal => "internal",
        }
    }
}

/// Top-level error type for ChronicleDB operations
#[derive(Error, Debug, Clone)]
pub enum ChronicleError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("version conflict: {0}")]
    VersionConflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("circuit open: {0}")]
    CircuitOpen(String),

    #[error("path traversal: {0}")]
    PathTraversal(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChronicleError {
    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new entity-not-found error
    pub fn entity_not_found<S: Into<String>>(msg: S) -> Self {
        Self::EntityNotFound(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new conflict error
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a new cancellation error
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a new transient I/O error
    pub fn io<S: Into<String>>(msg: S) -> Self {
        Self::Io(msg.into())
    }

    /// The taxonomy kind for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::EntityNotFound(_) => ErrorKind::EntityNotFound,
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::VersionConflict(_) => ErrorKind::VersionConflict,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::PathTraversal(_) => ErrorKind::PathTraversal,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::IoError,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Advisory HTTP status for a web adapter.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        self.kind().http_status()
    }

    /// Whether a bounded retry may succeed. Validation, not-found, and
    /// conflict kinds are never retried inside the engine.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<serde_json::Error> for ChronicleError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}
