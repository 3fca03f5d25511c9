//! HTTP transport for the master contract
//!
//! Every call is `POST <master>/<method>` with a JSON object of arguments and
//! a JSON result body.

use super::{ChunkAssignment, ChunkPlacement, MasterContract, ReplicaChunks};
use crate::chunk::ChunkKey;
use crate::common::{http_base_url, Error, Result};
use crate::coordination::{CoordinationGateway, MASTER_PATH};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

pub struct HttpMaster {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMaster {
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = http_base_url(address);
        tracing::info!("Using master at {}", base_url);
        Ok(Self { client, base_url })
    }

    /// Find the master through the address it advertises in the coordination
    /// service.
    pub async fn discover(gateway: &dyn CoordinationGateway, timeout: Duration) -> Result<Self> {
        let address = gateway
            .get(MASTER_PATH)
            .await?
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::Coordination("no master record".into()))?;
        let address = String::from_utf8_lossy(&address).to_string();
        Self::new(&address, timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, args: Value) -> Result<T> {
        let url = format!("{}/{}", self.base_url, method);
        let resp = self.client.post(&url).json(&args).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Remote(format!("{} returned {}: {}", method, status, body)));
        }
        Ok(resp.json().await?)
    }

    async fn call_unit(&self, method: &str, args: Value) -> Result<()> {
        let _: Value = self.call(method, args).await?;
        Ok(())
    }
}

/// Allocation answers use `false` or `null` for "no chunkservers".
fn placement_from(value: Value) -> Result<ChunkPlacement> {
    match value {
        Value::Null | Value::Bool(false) => Ok(ChunkPlacement::new()),
        other => Ok(serde_json::from_value(other)?),
    }
}

#[async_trait]
impl MasterContract for HttpMaster {
    async fn exists(&self, name: &str) -> Result<bool> {
        self.call("exists", json!({ "name": name })).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        let files: Option<Vec<String>> = self.call("list", json!({})).await?;
        Ok(files.unwrap_or_default())
    }

    async fn update_version(&self, name: &str, version: u64) -> Result<()> {
        self.call_unit("updatevrsn", json!({ "name": name, "vrsn": version }))
            .await
    }

    async fn allocate(
        &self,
        name: &str,
        num_chunks: usize,
        chunk_size: usize,
        first_sequence: u64,
    ) -> Result<ChunkPlacement> {
        let value = self
            .call(
                "alloc2",
                json!({
                    "name": name,
                    "num_chunks": num_chunks,
                    "chunksize": chunk_size,
                    "seq": first_sequence,
                }),
            )
            .await?;
        placement_from(value)
    }

    async fn add_file(&self, name: &str, assignment: &ChunkAssignment) -> Result<()> {
        self.call_unit("add_file", json!({ "name": name, "chunkmap": assignment }))
            .await
    }

    async fn chunk_ids(&self, name: &str) -> Result<Vec<ChunkKey>> {
        self.call("get_chunkuuids", json!({ "name": name })).await
    }

    async fn file_chunks(&self, name: &str) -> Result<ChunkPlacement> {
        let value = self.call("get_file_chunks", json!({ "name": name })).await?;
        placement_from(value)
    }

    async fn chunk_size(&self, name: &str) -> Result<usize> {
        self.call("get_chunksize", json!({ "name": name })).await
    }

    async fn chunk_locations(&self, chunk: &ChunkKey) -> Result<Vec<String>> {
        self.call("get_chunkloc", json!({ "chunkuuid": chunk })).await
    }

    async fn allocate_append(
        &self,
        num_chunks: usize,
        name: &str,
        first_sequence: u64,
    ) -> Result<ChunkPlacement> {
        let value = self
            .call(
                "alloc_append",
                json!({ "num_chunks": num_chunks, "name": name, "seq": first_sequence }),
            )
            .await?;
        placement_from(value)
    }

    async fn delete_chunks(&self, name: &str, chunks: &[ChunkKey]) -> Result<()> {
        self.call_unit("delete_chunks", json!({ "name": name, "chunkuuids": chunks }))
            .await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.call_unit("delete", json!({ "name": name, "date": "" }))
            .await
    }

    async fn rename(&self, placement: &ReplicaChunks, old: &str, new: &str) -> Result<()> {
        self.call_unit(
            "rename",
            json!({ "result": placement, "filename": old, "newfilename": new }),
        )
        .await
    }

    async fn dump_metadata(&self) -> Result<Value> {
        self.call("dump_metadata", json!({})).await
    }

    async fn get(&self, key: &str) -> Result<Value> {
        self.call("get", json!({ "key": key })).await
    }
}
