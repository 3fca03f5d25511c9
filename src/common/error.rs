//! Error types for minigfs

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === File namespace ===
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("File already exists: {0}")]
    AlreadyExists(String),

    #[error("File in use, try again later: {0}")]
    LockTimeout(String),

    // === Chunk transfer ===
    #[error("Checksum mismatch for chunk {chunk} after {attempts} attempts")]
    ChecksumFailure { chunk: String, attempts: u32 },

    #[error("No replicas available for chunk {0}")]
    NoReplicasAvailable(String),

    #[error("Remote unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("Remote error: {0}")]
    Remote(String),

    // === Coordination service ===
    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Coordination error: {0}")]
    Coordination(String),

    // === Wire ===
    #[error("Malformed chunk id: {0}")]
    MalformedChunkId(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Config ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Can the caller expect a later attempt of the same operation to succeed?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout(_)
                | Error::RemoteUnreachable(_)
                | Error::NoReplicasAvailable(_)
                | Error::CoordinationUnavailable(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Error::RemoteUnreachable(e.to_string())
        } else {
            Error::Remote(e.to_string())
        }
    }
}

impl From<etcd_client::Error> for Error {
    fn from(e: etcd_client::Error) -> Self {
        match e {
            etcd_client::Error::TransportError(_) | etcd_client::Error::InvalidUri(_) => {
                Error::CoordinationUnavailable(e.to_string())
            }
            _ => Error::Coordination(e.to_string()),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
