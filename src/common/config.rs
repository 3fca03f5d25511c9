//! Configuration for minigfs components

use crate::common::utils::parse_duration;
use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Coordination service connection
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Chunk I/O client settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Fleet watcher settings
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordination: CoordinationConfig::default(),
            client: ClientConfig::default(),
            watcher: WatcherConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then `MINIGFS__*`
    /// environment variables (e.g. `MINIGFS__CLIENT__LOCK_TIMEOUT=10s`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MINIGFS")
                .prefix_separator("__")
                .separator("__"),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.client.lock_timeout()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationBackend {
    /// In-process namespace (single process, tests)
    Memory,
    /// etcd cluster
    Etcd,
}

/// Coordination service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default = "default_backend")]
    pub backend: CoordinationBackend,

    /// Ensemble endpoints
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Key prefix every path is rooted under
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// TTL of the lease backing a held file lock, in seconds
    #[serde(default = "default_lock_lease_ttl")]
    pub lock_lease_ttl_secs: i64,
}

fn default_backend() -> CoordinationBackend {
    CoordinationBackend::Etcd
}
fn default_endpoints() -> Vec<String> {
    vec!["localhost:2379".to_string()]
}
fn default_namespace() -> String {
    "minigfs".to_string()
}
fn default_lock_lease_ttl() -> i64 {
    30
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            endpoints: default_endpoints(),
            namespace: default_namespace(),
            lock_lease_ttl_secs: default_lock_lease_ttl(),
        }
    }
}

/// How a write picks the replica for a chunk among its assigned locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicaSelection {
    /// Start at `chunk index mod replica count`
    #[default]
    RoundRobin,
    /// Always start at the first assigned location
    PrimaryFirst,
    /// Shuffle the locations per chunk
    Random,
}

/// Chunk I/O client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// How long to wait for a file lock, e.g. "5s"
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: String,

    /// Attempts per chunk write before giving up on a digest mismatch
    #[serde(default = "default_checksum_attempts")]
    pub checksum_attempts: u32,

    /// Number of chunks a new file is split into (before the size floor)
    #[serde(default = "default_target_chunks")]
    pub target_chunks: usize,

    /// Smallest chunk size in bytes
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,

    #[serde(default)]
    pub replica_selection: ReplicaSelection,

    /// Per-request timeout for master and chunkserver calls, e.g. "30s"
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

fn default_lock_timeout() -> String {
    "5s".to_string()
}
fn default_checksum_attempts() -> u32 {
    3
}
fn default_target_chunks() -> usize {
    crate::chunk::TARGET_CHUNKS
}
fn default_min_chunk_size() -> usize {
    crate::chunk::MIN_CHUNK_SIZE
}
fn default_request_timeout() -> String {
    "30s".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            lock_timeout: default_lock_timeout(),
            checksum_attempts: default_checksum_attempts(),
            target_chunks: default_target_chunks(),
            min_chunk_size: default_min_chunk_size(),
            replica_selection: ReplicaSelection::default(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl ClientConfig {
    pub fn lock_timeout(&self) -> Result<Duration> {
        parse_duration(&self.lock_timeout)
    }

    pub fn request_timeout(&self) -> Result<Duration> {
        parse_duration(&self.request_timeout)
    }
}

/// Fleet watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Host advertised under the `watcher` node; detected when absent
    #[serde(default)]
    pub advertise_host: Option<String>,

    /// Port advertised under the `watcher` node
    #[serde(default = "default_watcher_port")]
    pub port: u16,

    /// Parent path of the chunkserver registration nodes
    #[serde(default = "default_chunkserver_path")]
    pub chunkserver_path: String,

    /// Remote shell used to provision replacements
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,

    /// Command started on the departed host; `{coordination}` is replaced by
    /// the first coordination endpoint
    #[serde(default = "default_provision_command")]
    pub provision_command: String,
}

fn default_watcher_port() -> u16 {
    1401
}
fn default_chunkserver_path() -> String {
    "chunkserver".to_string()
}
fn default_ssh_program() -> String {
    "ssh".to_string()
}
fn default_provision_command() -> String {
    "minigfs-chunkserver --coordination {coordination}".to_string()
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            advertise_host: None,
            port: default_watcher_port(),
            chunkserver_path: default_chunkserver_path(),
            ssh_program: default_ssh_program(),
            provision_command: default_provision_command(),
        }
    }
}
