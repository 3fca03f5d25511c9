//! Chunk identity and file-to-chunk layout

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of chunks a new file is split into, before the size floor applies.
pub const TARGET_CHUNKS: usize = 15;

/// Smallest chunk size in bytes.
pub const MIN_CHUNK_SIZE: usize = 1_024_000;

/// Separator between file name and sequence number in wire chunk ids.
pub const CHUNK_ID_DELIMITER: &str = "$%#";

/// Identity of one chunk: the file it belongs to and its position in it.
///
/// On the wire a key is `<file>$%#<sequence>`; the sequence is whatever
/// follows the last delimiter, so file names may contain the delimiter too.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChunkKey {
    pub file: String,
    pub sequence: u64,
}

impl ChunkKey {
    pub fn new(file: impl Into<String>, sequence: u64) -> Self {
        Self {
            file: file.into(),
            sequence,
        }
    }

    /// Key of the chunk that follows this one in the same file.
    pub fn next(&self) -> Self {
        Self::new(self.file.clone(), self.sequence + 1)
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.file, CHUNK_ID_DELIMITER, self.sequence)
    }
}

impl FromStr for ChunkKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (file, seq) = s
            .rsplit_once(CHUNK_ID_DELIMITER)
            .ok_or_else(|| Error::MalformedChunkId(s.to_string()))?;
        let sequence = seq
            .parse()
            .map_err(|_| Error::MalformedChunkId(s.to_string()))?;
        Ok(Self::new(file, sequence))
    }
}

impl TryFrom<String> for ChunkKey {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ChunkKey> for String {
    fn from(key: ChunkKey) -> Self {
        key.to_string()
    }
}

/// How a payload of a given size is cut into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub chunk_size: usize,
    pub num_chunks: usize,
}

impl ChunkLayout {
    /// Layout for a new file: `max(min_chunk_size, size / target_chunks)` sized
    /// chunks, as many as needed to cover `size`.
    pub fn plan(size: usize, target_chunks: usize, min_chunk_size: usize) -> Self {
        let chunk_size = min_chunk_size.max(size / target_chunks.max(1)).max(1);
        Self::with_chunk_size(size, chunk_size)
    }

    /// Layout for `size` bytes at a fixed chunk size (appends, edits).
    pub fn with_chunk_size(size: usize, chunk_size: usize) -> Self {
        Self {
            chunk_size,
            num_chunks: size.div_ceil(chunk_size),
        }
    }

    /// Length of the last chunk, or 0 when there are no chunks.
    pub fn last_chunk_len(&self, size: usize) -> usize {
        match (self.num_chunks, size % self.chunk_size) {
            (0, _) => 0,
            (_, 0) => self.chunk_size,
            (_, rem) => rem,
        }
    }
}

/// Cut `data` into `chunk_size` windows; the last one may be shorter.
pub fn split_chunks(data: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    data.chunks(chunk_size.max(1)).collect()
}
