//! Gateway to the coordination service
//!
//! Both the chunk I/O client and the fleet watcher talk to the coordination
//! ensemble only through [`CoordinationGateway`]:
//! - path registration and node values (`watcher`, `master`, `chunkserver/<n>`)
//! - children watches and single-shot node watches
//! - per-file mutual exclusion under `files/<name>`

pub mod etcd;
pub mod memory;

pub use etcd::EtcdCoordination;
pub use memory::MemoryCoordination;

use crate::common::{encode_name, Config, CoordinationBackend, Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Path holding the fleet watcher's advertised address
pub const WATCHER_PATH: &str = "watcher";
/// Path holding the master's advertised address
pub const MASTER_PATH: &str = "master";
/// Parent of the per-file lock nodes
pub const FILES_PATH: &str = "files";

/// What happened to a watched node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The node was created or its value was written
    Changed(Vec<u8>),
    /// The node is gone
    Deleted,
}

/// Proof of a held lock, handed back to release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub path: String,
    pub key: Vec<u8>,
    pub lease: Option<i64>,
}

#[async_trait]
pub trait CoordinationGateway: Send + Sync + 'static {
    /// Create the node with an empty value unless it already exists.
    async fn ensure_path(&self, path: &str) -> Result<()>;

    /// Value of a node, `None` when the node does not exist.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Write a node's value, creating the node if needed.
    async fn set(&self, path: &str, value: &[u8]) -> Result<()>;

    /// Names of the nodes directly below `path`.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Stream of children lists for `path`. The current list is sent first,
    /// then a fresh list after every change below `path`.
    async fn watch_children(&self, path: &str) -> Result<mpsc::UnboundedReceiver<Vec<String>>>;

    /// Fires once, on the next change to the node at `path`.
    async fn watch_node(&self, path: &str) -> Result<oneshot::Receiver<NodeEvent>>;

    /// Take the lock at `path`, waiting at most `timeout`.
    /// Fails with [`Error::LockTimeout`] when the wait runs out.
    async fn acquire_lock(&self, path: &str, timeout: Duration) -> Result<LockToken>;

    async fn release_lock(&self, token: LockToken) -> Result<()>;
}

/// Connect to the backend selected in the configuration.
pub async fn connect(config: &Config) -> Result<Arc<dyn CoordinationGateway>> {
    match config.coordination.backend {
        CoordinationBackend::Memory => Ok(Arc::new(MemoryCoordination::new())),
        CoordinationBackend::Etcd => Ok(Arc::new(
            EtcdCoordination::connect(&config.coordination).await?,
        )),
    }
}

/// Lock path for a file
pub fn file_lock_path(file: &str) -> String {
    format!("{}/{}", FILES_PATH, encode_name(file))
}

/// A held per-file lock.
///
/// Call [`FileLock::release`] on every path out of an operation. If the guard
/// is dropped while still held (a panic mid-operation), the release is
/// spawned on the current runtime.
pub struct FileLock {
    gateway: Arc<dyn CoordinationGateway>,
    file: String,
    token: Option<LockToken>,
}

impl FileLock {
    pub async fn acquire(
        gateway: Arc<dyn CoordinationGateway>,
        file: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let token = match gateway.acquire_lock(&file_lock_path(file), timeout).await {
            Ok(token) => token,
            Err(Error::LockTimeout(_)) => return Err(Error::LockTimeout(file.to_string())),
            Err(e) => return Err(e),
        };
        tracing::debug!("Acquired lock on {}", file);

        Ok(Self {
            gateway,
            file: file.to_string(),
            token: Some(token),
        })
    }

    pub async fn release(mut self) -> Result<()> {
        if let Some(token) = self.token.take() {
            self.gateway.release_lock(token).await?;
            tracing::debug!("Released lock on {}", self.file);
        }
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        tracing::warn!("Lock on {} dropped while held, releasing", self.file);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let gateway = self.gateway.clone();
                handle.spawn(async move {
                    if let Err(e) = gateway.release_lock(token).await {
                        tracing::error!("Failed to release dropped lock: {}", e);
                    }
                });
            }
            Err(_) => tracing::error!("No runtime to release lock on {}", self.file),
        }
    }
}
