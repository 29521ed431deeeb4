//! Checksummed binary frames.
//!
//! WAL segments, metadata files, and the event archive share one frame
//! layout: `[magic 4][len u32 LE][crc32 u32 LE][body]`. Appendable streams
//! are just consecutive frames.

use crate::error::{ChronicleError, DbResult};

const HEADER_LEN: usize = 12;

/// Encode one frame.
#[must_use]
pub fn encode(magic: [u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + HEADER_LEN);
    out.extend_from_slice(&magic);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(body).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Decode a single frame occupying the whole buffer.
///
/// # Errors
///
/// Fails on bad magic, truncation, trailing bytes, or checksum mismatch.
pub fn decode(magic: [u8; 4], bytes: &[u8]) -> DbResult<Vec<u8>> {
    let (body, rest) = decode_prefix(magic, bytes)?;
    if !rest.is_empty() {
        return Err(ChronicleError::internal("unexpected trailing bytes after frame"));
    }
    Ok(body)
}

/// Decode the first frame of a buffer, returning the remainder.
///
/// # Errors
///
/// Fails on bad magic, truncation, or checksum mismatch.
pub fn decode_prefix(magic: [u8; 4], bytes: &[u8]) -> DbResult<(Vec<u8>, &[u8])> {
    if bytes.len() < HEADER_LEN {
        return Err(ChronicleError::internal("frame truncated"));
    }
    if bytes[0..4] != magic {
        return Err(ChronicleError::internal("bad frame magic"));
    }
    let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let crc = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let body = bytes
        .get(HEADER_LEN..HEADER_LEN + len)
        .ok_or_else(|| ChronicleError::internal("frame body truncated"))?;
    if crc32fast::hash(body) != crc {
        return Err(ChronicleError::internal("frame checksum mismatch"));
    }
    Ok((body.to_vec(), &bytes[HEADER_LEN + len..]))
}

/// Decode every frame of an append stream. A truncated trailing frame (torn
/// append) stops iteration without an error; everything before it is intact.
#[must_use]
pub fn decode_stream(magic: [u8; 4], mut bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        match decode_prefix(magic, bytes) {
            Ok((body, rest)) => {
                frames.push(body);
                bytes = rest;
            }
            Err(_) => break,
        }
    }
    frames
}
