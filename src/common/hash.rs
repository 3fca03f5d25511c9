//! Content digests for chunk payloads
//!
//! Chunkservers answer a write with the BLAKE3 digest of what they stored;
//! the client compares it against its own.

/// Compute BLAKE3 hash of data, return hex string
pub fn chunk_digest(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}
