//! HTTP transport for chunkservers
//!
//! - `PUT /chunks/<id>` stores a chunk and answers with its digest
//! - `GET /chunks/<id>` returns the payload
//! - `GET /name` identifies the server

use super::{ChunkServer, ChunkServerConnector, TransferError};
use crate::chunk::ChunkKey;
use crate::common::{encode_name, http_base_url};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

pub struct HttpChunkServer {
    id: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpChunkServer {
    pub fn new(id: &str, address: &str, client: reqwest::Client) -> Self {
        Self {
            id: id.to_string(),
            base_url: http_base_url(address),
            client,
        }
    }

    fn chunk_url(&self, chunk: &ChunkKey) -> String {
        format!("{}/chunks/{}", self.base_url, encode_name(&chunk.to_string()))
    }

    fn map_err(&self, e: reqwest::Error) -> TransferError {
        if e.is_connect() || e.is_timeout() {
            TransferError::Unreachable(self.id.clone())
        } else {
            TransferError::Remote(format!("{}: {}", self.id, e))
        }
    }

    async fn check(&self, resp: reqwest::Response) -> Result<reqwest::Response, TransferError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(TransferError::Remote(format!(
            "{} returned {}: {}",
            self.id, status, body
        )))
    }
}

#[async_trait]
impl ChunkServer for HttpChunkServer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write(&self, chunk: &ChunkKey, payload: Bytes) -> Result<String, TransferError> {
        let resp = self
            .client
            .put(self.chunk_url(chunk))
            .body(payload)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        let digest = self
            .check(resp)
            .await?
            .text()
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(digest.trim().to_string())
    }

    async fn read(&self, chunk: &ChunkKey) -> Result<Bytes, TransferError> {
        let resp = self
            .client
            .get(self.chunk_url(chunk))
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        self.check(resp)
            .await?
            .bytes()
            .await
            .map_err(|e| self.map_err(e))
    }

    async fn print_name(&self) -> Result<String, TransferError> {
        let resp = self
            .client
            .get(format!("{}/name", self.base_url))
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        self.check(resp)
            .await?
            .text()
            .await
            .map_err(|e| self.map_err(e))
    }
}

/// Connects over HTTP and probes each server with `print_name`.
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ChunkServerConnector for HttpConnector {
    async fn connect(
        &self,
        id: &str,
        address: &str,
    ) -> Result<Arc<dyn ChunkServer>, TransferError> {
        let server = HttpChunkServer::new(id, address, self.client.clone());
        let name = server.print_name().await?;
        tracing::debug!("Connected to chunkserver {} ({}) at {}", id, name.trim(), address);
        Ok(Arc::new(server))
    }
}
