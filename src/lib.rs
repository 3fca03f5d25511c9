//! # minigfs
//!
//! Client and fleet layer of a GFS-style distributed file store:
//! - Files split into chunks, each chunk placed on a chunkserver replica
//! - Digest-verified chunk writes with bounded retry
//! - Concurrent chunk reads reassembled in order
//! - Diff-based in-place edits that only move changed chunks
//! - Per-file locks held in the coordination service
//! - A fleet watcher that tracks chunkservers and replaces departed ones
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────────────────────────┐
//!            │   Coordination (etcd / memory)   │
//!            │  watcher · master · chunkserver/ │
//!            │  files/<name> locks              │
//!            └───┬──────────────────────────┬───┘
//!                │ locks, master address    │ registrations
//!      ┌─────────▼─────────┐       ┌────────▼─────────┐
//!      │   ChunkIoClient   │       │   FleetWatcher   │
//!      └───┬───────────┬───┘       │  membership +    │
//!          │ HTTP/JSON │ HTTP      │  provisioning    │
//!          │           │           └──────────────────┘
//!   ┌──────▼───┐  ┌────▼────┬─────────┬─────────┐
//!   │  Master  │  │ Chunk   │ Chunk   │ Chunk   │
//!   │          │  │ srv 1   │ srv 2   │ srv 3   │
//!   └──────────┘  └─────────┴─────────┴─────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the fleet watcher
//! ```bash
//! minigfs-watcher --config minigfs.toml
//! ```
//!
//! ### Use the client
//! ```no_run
//! # async fn demo() -> minigfs::Result<()> {
//! let config = minigfs::Config::load(None)?;
//! let client = minigfs::ChunkIoClient::connect(&config).await?;
//! client.write("notes.txt", b"hello".to_vec()).await?;
//! let data = client.read("notes.txt").await?;
//! client.edit("notes.txt", b"hello, world".to_vec()).await?;
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod client;
pub mod common;
pub mod coordination;
pub mod fleet;
pub mod master;
pub mod transfer;

// Re-export commonly used types
pub use chunk::{ChunkKey, ChunkLayout};
pub use client::{ChunkDetail, ChunkIoClient, EditReport};
pub use common::{Config, Error, Result};
pub use coordination::CoordinationGateway;
pub use fleet::{FleetHandle, FleetWatcher};
pub use master::MasterContract;
pub use transfer::ChunkTransferEngine;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
