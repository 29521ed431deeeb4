//! Binary codec for data files.
//!
//! A data file is a checksummed frame holding row-group metadata and the
//! independently decodable payload of each group, so statistics-based
//! skipping never pays for decoding skipped groups:
//!
//! ```text
//! [magic "CHRF"][format_version u32 LE][len u64 LE][crc32 u32 LE][bincode envelope]
//! ```
//!
//! Files are immutable once written; a flush rewrites the file atomically
//! with the new group appended.

use serde::{Deserialize, Serialize};

use crate::error::{ChronicleError, DbResult};

use super::{RowGroup, RowGroupMeta};

/// File magic.
pub const MAGIC: [u8; 4] = *b"CHRF";

/// Current binary format version. The facade bumps the row-group cache
/// version when this changes.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct FileEnvelope {
    metas: Vec<RowGroupMeta>,
    /// Per-group bincode payloads (column chunks), parallel to `metas`.
    payloads: Vec<Vec<u8>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupPayload {
    columns: Vec<super::ColumnChunk>,
}

/// A decoded row group handed out by the cache.
pub type DecodedRowGroup = RowGroup;

/// In-memory representation of a data file.
#[derive(Debug, Default)]
pub struct DataFile {
    metas: Vec<RowGroupMeta>,
    payloads: Vec<Vec<u8>>,
}

impl DataFile {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Row-group metadata, ordered by position.
    #[must_use]
    pub fn metas(&self) -> &[RowGroupMeta] {
        &self.metas
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.metas.len()
    }

    #[must_use]
    pub fn total_rows(&self) -> u64 {
        self.metas.iter().map(|m| m.row_count).sum()
    }

    /// Highest covered event sequence across groups.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.metas.iter().map(|m| m.last_seq).max().unwrap_or(0)
    }

    /// Whether the file already contains a group (promotion idempotency).
    #[must_use]
    pub fn contains_group(&self, group_id: &str) -> bool {
        self.metas.iter().any(|m| m.group_id == group_id)
    }

    /// Append a row group.
    ///
    /// # Errors
    ///
    /// Fails when the group payload cannot be encoded.
    pub fn append_group(&mut self, group: RowGroup) -> DbResult<()> {
        let payload = bincode::serialize(&GroupPayload { columns: group.columns })
            .map_err(|e| ChronicleError::internal(format!("row group encode failed: {e}")))?;
        self.metas.push(group.meta);
        self.payloads.push(payload);
        Ok(())
    }

    /// Decode the group at `index`.
    ///
    /// # Errors
    ///
    /// Fails on an out-of-range index or a corrupt payload.
    pub fn decode_group(&self, index: usize) -> DbResult<DecodedRowGroup> {
        let meta = self
            .metas
            .get(index)
            .ok_or_else(|| ChronicleError::internal(format!("row group {index} out of range")))?;
        let payload = self
            .payloads
            .get(index)
            .ok_or_else(|| ChronicleError::internal(format!("row group {index} missing payload")))?;
        let decoded: GroupPayload = bincode::deserialize(payload)
            .map_err(|e| ChronicleError::internal(format!("row group decode failed: {e}")))?;
        Ok(RowGroup {
            meta: meta.clone(),
            columns: decoded.columns,
        })
    }

    /// Rebuild the file from whole groups (compaction path).
    ///
    /// # Errors
    ///
    /// Fails when a group payload cannot be encoded.
    pub fn from_groups(groups: Vec<RowGroup>) -> DbResult<Self> {
        let mut file = Self::empty();
        for group in groups {
            file.append_group(group)?;
        }
        Ok(file)
    }

    /// Encode the full file with checksum framing.
    ///
    /// # Errors
    ///
    /// Fails when the envelope cannot be encoded.
    pub fn encode(&self) -> DbResult<Vec<u8>> {
        let envelope = FileEnvelope {
            metas: self.metas.clone(),
            payloads: self.payloads.clone(),
        };
        let body = bincode::serialize(&envelope)
            .map_err(|e| ChronicleError::internal(format!("data file encode failed: {e}")))?;

        let mut out = Vec::with_capacity(body.len() + 20);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&(body.len() as u64).to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a file, verifying magic, version, and checksum.
    ///
    /// # Errors
    ///
    /// Fails on truncated, corrupt, or version-incompatible bytes.
    pub fn decode(bytes: &[u8]) -> DbResult<Self> {
        if bytes.len() < 20 {
            return Err(ChronicleError::internal("data file truncated"));
        }
        if bytes[0..4] != MAGIC {
            return Err(ChronicleError::internal("bad data file magic"));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != FORMAT_VERSION {
            return Err(ChronicleError::internal(format!(
                "unsupported data file format version {version}"
            )));
        }
        let len = u64::from_le_bytes([
            bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
        ]) as usize;
        let crc = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let body = bytes
            .get(20..20 + len)
            .ok_or_else(|| ChronicleError::internal("data file body truncated"))?;
        if crc32fast::hash(body) != crc {
            return Err(ChronicleError::internal("data file checksum mismatch"));
        }
        let envelope: FileEnvelope = bincode::deserialize(body)
            .map_err(|e| ChronicleError::internal(format!("data file decode failed: {e}")))?;
        if envelope.metas.len() != envelope.payloads.len() {
            return Err(ChronicleError::internal("data file meta/payload mismatch"));
        }
        Ok(Self {
            metas: envelope.metas,
            payloads: envelope.payloads,
        })
    }
}
