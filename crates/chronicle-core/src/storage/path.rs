//! Storage path validation.
//!
//! Paths are forward-slash-separated and strictly relative. Anything that
//! could escape the backend root or alias another object is rejected with a
//! `PATH_TRAVERSAL` error before it reaches a backend implementation.

use super::{StorageError, StorageResult};

/// Validate a storage path, returning it unchanged on success.
///
/// # Errors
///
/// Rejects empty paths, absolute paths, backslashes, `..` segments, `.`
/// segments, empty segments (`//`), and trailing slashes.
pub fn validate(path: &str) -> StorageResult<&str> {
    let reject = |reason| {
        Err(StorageError::PathTraversal {
            path: path.to_string(),
            reason,
        })
    };

    if path.is_empty() {
        return reject("empty path");
    }
    if path.starts_with('/') {
        return reject("absolute path");
    }
    if path.ends_with('/') {
        return reject("trailing slash");
    }
    if path.contains('\\') {
        return reject("backslash separator");
    }
    if path.contains('\0') {
        return reject("NUL byte");
    }
    for segment in path.split('/') {
        match segment {
            "" => return reject("empty segment"),
            "." | ".." => return reject("relative segment"),
            _ => {}
        }
    }
    Ok(path)
}

/// Validate a listing prefix. The empty prefix (whole root) is allowed, as is
/// a trailing slash.
pub fn validate_prefix(prefix: &str) -> StorageResult<&str> {
    if prefix.is_empty() {
        return Ok(prefix);
    }
    validate(prefix.trim_end_matches('/')).map(|_| prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_relative_paths() {
        assert!(validate("data/posts.parquet").is_ok());
        assert!(validate("posts/_wal/01H2").is_ok());
        assert!(validate("a").is_ok());
    }

    #[test]
    fn test_rejects_traversal() {
        for bad in ["", "/abs", "a//b", "a/../b", "./a", "a/.", "a\\b", "a/", "a/\0"] {
            assert!(validate(bad).is_err(), "expected rejection for {bad:?}");
        }
    }

    #[test]
    fn test_prefix_allows_empty_and_trailing_slash() {
        assert!(validate_prefix("").is_ok());
        assert!(validate_prefix("posts/").is_ok());
        assert!(validate_prefix("/posts").is_err());
    }
}
