//! Master contract
//!
//! The master owns file metadata and chunk placement. The client consumes it
//! through [`MasterContract`]; chunk ids cross this boundary as [`ChunkKey`]s
//! and are only rendered to their wire form by the transport.

pub mod http;

pub use http::HttpMaster;

use crate::chunk::ChunkKey;
use crate::common::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Replica locations assigned to each chunk, in chunk order.
pub type ChunkPlacement = BTreeMap<ChunkKey, Vec<String>>;

/// The replica each chunk was actually written to.
pub type ChunkAssignment = BTreeMap<ChunkKey, String>;

/// Chunks held by each replica, used to re-key a file on rename.
pub type ReplicaChunks = BTreeMap<String, Vec<ChunkKey>>;

/// Chunkserver ordinal to advertised address.
pub type ChunkserverDirectory = BTreeMap<String, String>;

#[async_trait]
pub trait MasterContract: Send + Sync + 'static {
    async fn exists(&self, name: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<String>>;

    async fn update_version(&self, name: &str, version: u64) -> Result<()>;

    /// Allocate chunks for a new file. An empty placement means no
    /// chunkservers are available.
    async fn allocate(
        &self,
        name: &str,
        num_chunks: usize,
        chunk_size: usize,
        first_sequence: u64,
    ) -> Result<ChunkPlacement>;

    /// Record where every chunk of a new file was written.
    async fn add_file(&self, name: &str, assignment: &ChunkAssignment) -> Result<()>;

    /// Chunk keys of a file in sequence order.
    async fn chunk_ids(&self, name: &str) -> Result<Vec<ChunkKey>>;

    async fn file_chunks(&self, name: &str) -> Result<ChunkPlacement>;

    async fn chunk_size(&self, name: &str) -> Result<usize>;

    async fn chunk_locations(&self, chunk: &ChunkKey) -> Result<Vec<String>>;

    /// Allocate chunks appended to an existing file.
    async fn allocate_append(
        &self,
        num_chunks: usize,
        name: &str,
        first_sequence: u64,
    ) -> Result<ChunkPlacement>;

    async fn delete_chunks(&self, name: &str, chunks: &[ChunkKey]) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    async fn rename(&self, placement: &ReplicaChunks, old: &str, new: &str) -> Result<()>;

    async fn dump_metadata(&self) -> Result<serde_json::Value>;

    /// Generic key lookup on the master.
    async fn get(&self, key: &str) -> Result<serde_json::Value>;

    /// Currently registered chunkservers.
    async fn chunkservers(&self) -> Result<ChunkserverDirectory> {
        let value = self.get("chunkservers").await?;
        if value.is_null() {
            return Ok(ChunkserverDirectory::new());
        }
        Ok(serde_json::from_value(value)?)
    }
}
