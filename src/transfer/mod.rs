//! Chunk transfer against a single chunkserver
//!
//! [`ChunkTransferEngine`] owns the per-endpoint policy: a write is accepted
//! only once the chunkserver echoes the digest we computed, and is resent on
//! a mismatch up to a fixed number of attempts. An unreachable endpoint is
//! reported at once so the caller can route to another replica. Reads are
//! passed through without retry.

pub mod http;

pub use http::{HttpChunkServer, HttpConnector};

use crate::chunk::ChunkKey;
use crate::common::{chunk_digest, Error};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("chunkserver {0} unreachable")]
    Unreachable(String),

    #[error("checksum mismatch for chunk {chunk} after {attempts} attempts")]
    ChecksumFailure { chunk: String, attempts: u32 },

    #[error("chunkserver fault: {0}")]
    Remote(String),
}

impl From<TransferError> for Error {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Unreachable(server) => Error::RemoteUnreachable(server),
            TransferError::ChecksumFailure { chunk, attempts } => {
                Error::ChecksumFailure { chunk, attempts }
            }
            TransferError::Remote(msg) => Error::Remote(msg),
        }
    }
}

/// One chunkserver endpoint.
#[async_trait]
pub trait ChunkServer: Send + Sync {
    /// Ordinal this endpoint is registered under
    fn id(&self) -> &str;

    /// Store a chunk, returning the digest of what was stored.
    async fn write(&self, chunk: &ChunkKey, payload: Bytes) -> Result<String, TransferError>;

    async fn read(&self, chunk: &ChunkKey) -> Result<Bytes, TransferError>;

    /// Identity probe used when a connection is established.
    async fn print_name(&self) -> Result<String, TransferError>;
}

/// Opens connections to chunkservers by ordinal and advertised address.
#[async_trait]
pub trait ChunkServerConnector: Send + Sync {
    async fn connect(&self, id: &str, address: &str)
        -> Result<Arc<dyn ChunkServer>, TransferError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkTransferEngine {
    max_attempts: u32,
}

impl Default for ChunkTransferEngine {
    fn default() -> Self {
        Self::new(3)
    }
}

impl ChunkTransferEngine {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Write one chunk and verify the returned digest.
    pub async fn write(
        &self,
        server: &dyn ChunkServer,
        chunk: &ChunkKey,
        payload: Bytes,
    ) -> Result<String, TransferError> {
        let digest = chunk_digest(&payload);

        for attempt in 1..=self.max_attempts {
            let returned = server.write(chunk, payload.clone()).await?;
            if returned == digest {
                debug!(
                    "Wrote chunk {} ({} bytes) to {} on attempt {}",
                    chunk,
                    payload.len(),
                    server.id(),
                    attempt
                );
                return Ok(digest);
            }
            warn!(
                "Digest mismatch writing chunk {} to {} (attempt {}/{})",
                chunk,
                server.id(),
                attempt,
                self.max_attempts
            );
        }

        Err(TransferError::ChecksumFailure {
            chunk: chunk.to_string(),
            attempts: self.max_attempts,
        })
    }

    pub async fn read(
        &self,
        server: &dyn ChunkServer,
        chunk: &ChunkKey,
    ) -> Result<Bytes, TransferError> {
        let payload = server.read(chunk).await?;
        debug!("Read chunk {} ({} bytes) from {}", chunk, payload.len(), server.id());
        Ok(payload)
    }
}
