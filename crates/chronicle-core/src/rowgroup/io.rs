//! Data-file I/O against a storage backend.

use std::sync::Arc;

use crate::error::DbResult;
use crate::storage::{StorageBackend, StorageError};

use super::DataFile;

/// Load and decode a data file; `None` when the file does not exist.
///
/// # Errors
///
/// Fails on storage errors other than not-found, or corrupt contents.
pub async fn load_file(backend: &Arc<dyn StorageBackend>, path: &str) -> DbResult<Option<DataFile>> {
    match backend.read(path).await {
        Ok(bytes) => Ok(Some(DataFile::decode(&bytes)?)),
        Err(StorageError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Encode and atomically replace a data file.
///
/// # Errors
///
/// Fails when encoding or the write fails.
pub async fn save_file(
    backend: &Arc<dyn StorageBackend>,
    path: &str,
    file: &DataFile,
) -> DbResult<()> {
    let bytes = file.encode()?;
    backend.write_atomic(path, &bytes).await?;
    Ok(())
}
