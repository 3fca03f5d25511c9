//! Common utilities and types shared across minigfs

pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

pub use config::{
    ClientConfig, Config, CoordinationBackend, CoordinationConfig, ReplicaSelection,
    WatcherConfig,
};
pub use error::{Error, Result};
pub use hash::chunk_digest;
pub use utils::{
    detect_local_ip, encode_name, format_bytes, http_base_url, normalize_address,
    parse_duration,
};
