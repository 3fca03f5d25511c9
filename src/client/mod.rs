//! Chunk I/O client
//!
//! Whole-file operations on top of the master contract and the chunkservers.
//! Every operation that touches chunk data holds the file's lock for its full
//! duration and releases it on every exit path:
//!
//! ```text
//! lock ──► plan (master) ──► transfer (chunkservers) ──► commit (master) ──► unlock
//! ```
//!
//! Chunk writes go to one replica picked from the chunk's candidates and fail
//! over to the next candidate when a replica is unreachable. Reads fetch all
//! chunks concurrently and reassemble them by index.

pub mod edit;
pub mod placement;

pub use edit::{EditKind, EditPlan};
pub use placement::{ExcludedReplicas, ReplicaCandidates};

use crate::chunk::{split_chunks, ChunkKey, ChunkLayout};
use crate::common::{format_bytes, ClientConfig, Config, Error, ReplicaSelection, Result};
use crate::coordination::{self, CoordinationGateway, FileLock};
use crate::master::{ChunkAssignment, ChunkPlacement, HttpMaster, MasterContract, ReplicaChunks};
use crate::transfer::{
    ChunkServer, ChunkServerConnector, ChunkTransferEngine, HttpConnector, TransferError,
};
use bytes::{Bytes, BytesMut};
use futures_util::future::{join_all, try_join_all};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One chunk of a file as read back from a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDetail {
    pub key: ChunkKey,
    pub locations: Vec<String>,
    pub payload: Bytes,
}

/// What an edit changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditReport {
    pub kind: EditKind,
    pub rewritten: usize,
    pub deleted: usize,
    pub appended: usize,
}

/// Chunkservers connected for one operation.
#[derive(Default)]
struct Connections {
    servers: HashMap<String, Arc<dyn ChunkServer>>,
    excluded: ExcludedReplicas,
}

impl Connections {
    fn get(&self, replica: &str) -> Option<&Arc<dyn ChunkServer>> {
        if self.excluded.contains(replica) {
            return None;
        }
        self.servers.get(replica)
    }
}

pub struct ChunkIoClient {
    master: Arc<dyn MasterContract>,
    gateway: Arc<dyn CoordinationGateway>,
    connector: Arc<dyn ChunkServerConnector>,
    engine: ChunkTransferEngine,
    selection: ReplicaSelection,
    lock_timeout: Duration,
    target_chunks: usize,
    min_chunk_size: usize,
}

impl ChunkIoClient {
    pub fn new(
        master: Arc<dyn MasterContract>,
        gateway: Arc<dyn CoordinationGateway>,
        connector: Arc<dyn ChunkServerConnector>,
        config: &ClientConfig,
    ) -> Result<Self> {
        Ok(Self {
            master,
            gateway,
            connector,
            engine: ChunkTransferEngine::new(config.checksum_attempts),
            selection: config.replica_selection,
            lock_timeout: config.lock_timeout()?,
            target_chunks: config.target_chunks,
            min_chunk_size: config.min_chunk_size,
        })
    }

    /// Connect to the coordination service, discover the master through it
    /// and reach chunkservers over HTTP.
    pub async fn connect(config: &Config) -> Result<Self> {
        let gateway = coordination::connect(config).await?;
        let timeout = config.client.request_timeout()?;
        let master = HttpMaster::discover(gateway.as_ref(), timeout).await?;
        let connector = HttpConnector::new(timeout)?;
        Self::new(
            Arc::new(master),
            gateway,
            Arc::new(connector),
            &config.client,
        )
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        self.master.exists(name).await
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        self.master.list().await
    }

    pub async fn dump_metadata(&self) -> Result<serde_json::Value> {
        self.master.dump_metadata().await
    }

    /// Store `data` under `name`. An existing file is edited in place.
    pub async fn write(&self, name: &str, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        if self.master.exists(name).await? {
            self.master.update_version(name, 1).await?;
            self.edit(name, data).await?;
            return Ok(());
        }
        self.master.update_version(name, 0).await?;

        let lock = self.lock(name).await?;
        let result = self.write_new_locked(name, data).await;
        release_after(lock, result).await
    }

    pub async fn read(&self, name: &str) -> Result<Bytes> {
        let (data, _) = self.read_with_details(name).await?;
        Ok(data)
    }

    /// Read a file along with each chunk's key, locations and payload.
    pub async fn read_with_details(&self, name: &str) -> Result<(Bytes, Vec<ChunkDetail>)> {
        self.ensure_exists(name).await?;
        let lock = self.lock(name).await?;
        let result = self.read_locked(name).await;
        release_after(lock, result).await
    }

    /// Replace the content of `name`, transferring only the chunks that
    /// changed.
    pub async fn edit(&self, name: &str, new: impl Into<Bytes>) -> Result<EditReport> {
        let new = new.into();
        self.ensure_exists(name).await?;
        let lock = self.lock(name).await?;
        let result = self.edit_locked(name, new).await;
        release_after(lock, result).await
    }

    pub async fn append(&self, name: &str, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.ensure_exists(name).await?;
        if data.is_empty() {
            return Ok(());
        }
        let lock = self.lock(name).await?;
        let result = self.append_locked(name, data).await;
        release_after(lock, result).await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.ensure_exists(name).await?;
        self.master.delete(name).await?;
        info!("Deleted {}", name);
        Ok(())
    }

    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.ensure_exists(old).await?;
        if self.master.exists(new).await? {
            return Err(Error::AlreadyExists(new.to_string()));
        }

        let mut by_replica = ReplicaChunks::new();
        for key in self.master.chunk_ids(old).await? {
            for replica in self.master.chunk_locations(&key).await? {
                by_replica.entry(replica).or_default().push(key.clone());
            }
        }
        self.master.rename(&by_replica, old, new).await?;
        info!("Renamed {} to {}", old, new);
        Ok(())
    }

    async fn ensure_exists(&self, name: &str) -> Result<()> {
        if self.master.exists(name).await? {
            Ok(())
        } else {
            Err(Error::NotFound(name.to_string()))
        }
    }

    async fn lock(&self, name: &str) -> Result<FileLock> {
        FileLock::acquire(self.gateway.clone(), name, self.lock_timeout).await
    }

    async fn write_new_locked(&self, name: &str, data: Bytes) -> Result<()> {
        let start = Instant::now();
        if data.is_empty() {
            self.master.add_file(name, &ChunkAssignment::new()).await?;
            info!("Wrote empty file {}", name);
            return Ok(());
        }

        let layout = ChunkLayout::plan(data.len(), self.target_chunks, self.min_chunk_size);
        debug!(
            "Planned {} chunks of {} bytes for {} (last {} bytes)",
            layout.num_chunks,
            layout.chunk_size,
            name,
            layout.last_chunk_len(data.len())
        );
        let placement = self
            .master
            .allocate(name, layout.num_chunks, layout.chunk_size, 0)
            .await?;
        if placement.is_empty() {
            return Err(Error::NoReplicasAvailable(name.to_string()));
        }

        let chunks = pair_with_payloads(placement, &data, layout.chunk_size)?;
        let assignment = self.place_chunks(chunks).await?;
        self.master.add_file(name, &assignment).await?;

        info!(
            "Wrote {} ({}, {} chunks) in {:?}",
            name,
            format_bytes(data.len() as u64),
            layout.num_chunks,
            start.elapsed()
        );
        Ok(())
    }

    async fn read_locked(&self, name: &str) -> Result<(Bytes, Vec<ChunkDetail>)> {
        let start = Instant::now();
        let keys = self.master.chunk_ids(name).await?;
        let placement = self.master.file_chunks(name).await?;
        let conns = Arc::new(self.establish(placement.values().flatten()).await?);

        let tasks: Vec<_> = keys
            .into_iter()
            .map(|key| {
                let locations = placement.get(&key).cloned().unwrap_or_default();
                let conns = conns.clone();
                let engine = self.engine;
                tokio::spawn(async move {
                    let payload = fetch_chunk(&engine, &conns, &key, &locations).await?;
                    Ok::<_, Error>(ChunkDetail {
                        key,
                        locations,
                        payload,
                    })
                })
            })
            .collect();

        // join_all keeps task order, so details land at their chunk index
        let mut details = Vec::with_capacity(tasks.len());
        for joined in join_all(tasks).await {
            let detail = joined.map_err(|e| Error::Internal(format!("chunk read task: {}", e)))??;
            details.push(detail);
        }

        let total = details.iter().map(|d| d.payload.len()).sum();
        let mut data = BytesMut::with_capacity(total);
        for detail in &details {
            data.extend_from_slice(&detail.payload);
        }

        info!(
            "Read {} ({}, {} chunks) in {:?}",
            name,
            format_bytes(total as u64),
            details.len(),
            start.elapsed()
        );
        Ok((data.freeze(), details))
    }

    async fn edit_locked(&self, name: &str, new: Bytes) -> Result<EditReport> {
        let (old, details) = self.read_locked(name).await?;
        let chunk_size = self.file_chunk_size(name, new.len()).await?;
        let plan = EditPlan::compute(&old, &new, chunk_size, details.len());
        debug!("Edit plan for {}: {:?}", name, plan);

        // New chunks first: they can be handed back if a rewrite fails.
        let mut appended = Vec::new();
        if let Some(range) = plan.append.clone() {
            let next = details.last().map(|d| d.key.next().sequence).unwrap_or(0);
            appended = self
                .append_chunks(name, new.slice(range), chunk_size, next)
                .await?;
        }

        if !plan.rewrites.is_empty() {
            let targets = plan
                .rewrites
                .iter()
                .map(|(index, range)| (&details[*index], new.slice(range.clone())))
                .collect();
            if let Err(e) = self.replace_chunks(targets).await {
                self.release_chunks(name, &appended).await;
                return Err(e);
            }
        }

        if !plan.deletions.is_empty() {
            let doomed: Vec<ChunkKey> = plan
                .deletions
                .iter()
                .map(|index| details[*index].key.clone())
                .collect();
            self.master.delete_chunks(name, &doomed).await?;
        }

        self.master.update_version(name, 1).await?;

        let report = EditReport {
            kind: plan.kind,
            rewritten: plan.rewrites.len(),
            deleted: plan.deletions.len(),
            appended: appended.len(),
        };
        info!(
            "Edited {}: {:?}, {} rewritten, {} deleted, {} appended",
            name, report.kind, report.rewritten, report.deleted, report.appended
        );
        Ok(report)
    }

    async fn append_locked(&self, name: &str, data: Bytes) -> Result<()> {
        let start = Instant::now();
        let chunk_size = self.file_chunk_size(name, data.len()).await?;
        let keys = self.master.chunk_ids(name).await?;

        // A short final chunk takes the head of the data.
        let mut rest = data.clone();
        let mut top_up = None;
        if let Some(last) = keys.last() {
            let locations = self.master.chunk_locations(last).await?;
            let conns = self.establish(locations.iter()).await?;
            let tail = fetch_chunk(&self.engine, &conns, last, &locations).await?;
            if tail.len() < chunk_size {
                let fill = (chunk_size - tail.len()).min(rest.len());
                let mut topped = BytesMut::with_capacity(tail.len() + fill);
                topped.extend_from_slice(&tail);
                topped.extend_from_slice(&rest[..fill]);
                let detail = ChunkDetail {
                    key: last.clone(),
                    locations,
                    payload: tail,
                };
                top_up = Some((detail, topped.freeze()));
                rest = rest.slice(fill..);
            }
        }

        let mut appended = Vec::new();
        if !rest.is_empty() {
            let next = keys.last().map(|k| k.next().sequence).unwrap_or(0);
            appended = self.append_chunks(name, rest, chunk_size, next).await?;
        }

        if let Some((detail, topped)) = &top_up {
            if let Err(e) = self.replace_chunks(vec![(detail, topped.clone())]).await {
                self.release_chunks(name, &appended).await;
                return Err(e);
            }
        }

        info!(
            "Appended {} to {} ({} new chunks) in {:?}",
            format_bytes(data.len() as u64),
            name,
            appended.len(),
            start.elapsed()
        );
        Ok(())
    }

    /// Allocate, place and record new chunks at the end of a file. Chunks
    /// allocated for a failed placement are handed back to the master.
    async fn append_chunks(
        &self,
        name: &str,
        data: Bytes,
        chunk_size: usize,
        first_sequence: u64,
    ) -> Result<Vec<ChunkKey>> {
        let layout = ChunkLayout::with_chunk_size(data.len(), chunk_size);
        let placement = self
            .master
            .allocate_append(layout.num_chunks, name, first_sequence)
            .await?;
        if placement.is_empty() {
            return Err(Error::NoReplicasAvailable(name.to_string()));
        }

        let allocated: Vec<ChunkKey> = placement.keys().cloned().collect();
        let result = match pair_with_payloads(placement, &data, layout.chunk_size) {
            Ok(chunks) => self.place_chunks(chunks).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.release_chunks(name, &allocated).await;
            return Err(e);
        }
        Ok(allocated)
    }

    async fn release_chunks(&self, name: &str, chunks: &[ChunkKey]) {
        if chunks.is_empty() {
            return;
        }
        warn!("Releasing {} chunks of {}", chunks.len(), name);
        if let Err(e) = self.master.delete_chunks(name, chunks).await {
            warn!("Failed to release chunks of {}: {}", name, e);
        }
    }

    /// Chunk size recorded for a file, or a fresh plan for files that never
    /// had chunks.
    async fn file_chunk_size(&self, name: &str, incoming: usize) -> Result<usize> {
        match self.master.chunk_size(name).await? {
            0 => Ok(ChunkLayout::plan(incoming, self.target_chunks, self.min_chunk_size).chunk_size),
            size => Ok(size),
        }
    }

    /// Connect the chunkservers an operation needs. Servers that are not
    /// registered or do not answer the probe start out excluded.
    async fn establish<'a>(
        &self,
        replicas: impl IntoIterator<Item = &'a String>,
    ) -> Result<Connections> {
        let wanted: BTreeSet<&String> = replicas.into_iter().collect();
        if wanted.is_empty() {
            return Ok(Connections::default());
        }
        let directory = self.master.chunkservers().await?;

        let attempts = wanted.into_iter().map(|id| {
            let address = directory.get(id).cloned();
            async move {
                let res = match address {
                    Some(address) => self.connector.connect(id, &address).await,
                    None => Err(TransferError::Unreachable(id.clone())),
                };
                (id.clone(), res)
            }
        });

        let mut conns = Connections::default();
        for (id, res) in join_all(attempts).await {
            match res {
                Ok(server) => {
                    conns.servers.insert(id, server);
                }
                Err(e) => {
                    warn!("Chunkserver {} not available: {}", id, e);
                    conns.excluded.exclude(&id);
                }
            }
        }
        Ok(conns)
    }

    /// Write every chunk to one of its replicas, returning where each landed.
    async fn place_chunks(
        &self,
        chunks: Vec<(ChunkKey, Vec<String>, Bytes)>,
    ) -> Result<ChunkAssignment> {
        let conns = self
            .establish(chunks.iter().flat_map(|(_, locations, _)| locations.iter()))
            .await?;

        let writes = chunks.into_iter().map(|(key, locations, payload)| {
            let conns = &conns;
            async move {
                let replica = self.place_chunk(conns, &key, &locations, payload).await?;
                Ok::<_, Error>((key, replica))
            }
        });
        Ok(try_join_all(writes).await?.into_iter().collect())
    }

    async fn place_chunk(
        &self,
        conns: &Connections,
        key: &ChunkKey,
        locations: &[String],
        payload: Bytes,
    ) -> Result<String> {
        let index = key.sequence as usize;
        for replica in ReplicaCandidates::new(locations, self.selection, index, &conns.excluded) {
            let Some(server) = conns.get(&replica) else {
                continue;
            };
            match self.engine.write(server.as_ref(), key, payload.clone()).await {
                Ok(_) => return Ok(replica),
                Err(TransferError::Unreachable(_)) => {
                    warn!("Chunkserver {} unreachable, excluding it", replica);
                    conns.excluded.exclude(&replica);
                }
                Err(TransferError::Remote(msg)) => {
                    warn!("Writing chunk {} to {} failed: {}", key, replica, msg);
                }
                Err(e @ TransferError::ChecksumFailure { .. }) => return Err(e.into()),
            }
        }
        Err(Error::NoReplicasAvailable(key.to_string()))
    }

    /// Overwrite existing chunks on every replica that holds them. A chunk
    /// fails only when none of its replicas took the write.
    async fn replace_chunks(&self, targets: Vec<(&ChunkDetail, Bytes)>) -> Result<()> {
        let conns = self
            .establish(targets.iter().flat_map(|(detail, _)| detail.locations.iter()))
            .await?;

        let writes = targets.into_iter().map(|(detail, payload)| {
            let conns = &conns;
            async move {
                let mut accepted = 0;
                for replica in &detail.locations {
                    let Some(server) = conns.get(replica) else {
                        warn!("Skipping excluded replica {} of {}", replica, detail.key);
                        continue;
                    };
                    match self.engine.write(server.as_ref(), &detail.key, payload.clone()).await {
                        Ok(_) => accepted += 1,
                        Err(TransferError::Unreachable(_)) => {
                            warn!("Chunkserver {} unreachable, excluding it", replica);
                            conns.excluded.exclude(replica);
                        }
                        Err(TransferError::Remote(msg)) => {
                            warn!("Rewriting chunk {} on {} failed: {}", detail.key, replica, msg);
                        }
                        Err(e @ TransferError::ChecksumFailure { .. }) => return Err(e.into()),
                    }
                }
                if accepted == 0 {
                    return Err(Error::NoReplicasAvailable(detail.key.to_string()));
                }
                Ok(())
            }
        });
        try_join_all(writes).await?;
        Ok(())
    }
}

/// Release the lock, surfacing the operation's own error first.
async fn release_after<T>(lock: FileLock, result: Result<T>) -> Result<T> {
    let released = lock.release().await;
    match (result, released) {
        (Err(e), Err(release)) => {
            warn!("Lock release failed after error: {}", release);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(release)) => Err(release),
        (Ok(value), Ok(())) => Ok(value),
    }
}

/// Line up allocated chunks (in sequence order) with their slices of `data`.
fn pair_with_payloads(
    placement: ChunkPlacement,
    data: &Bytes,
    chunk_size: usize,
) -> Result<Vec<(ChunkKey, Vec<String>, Bytes)>> {
    let slices = split_chunks(data, chunk_size);
    if slices.len() != placement.len() {
        return Err(Error::Remote(format!(
            "master allocated {} chunks, expected {}",
            placement.len(),
            slices.len()
        )));
    }
    Ok(placement
        .into_iter()
        .zip(slices)
        .map(|((key, locations), slice)| (key, locations, data.slice_ref(slice)))
        .collect())
}

/// Read one chunk, moving to the next location when a replica fails.
async fn fetch_chunk(
    engine: &ChunkTransferEngine,
    conns: &Connections,
    key: &ChunkKey,
    locations: &[String],
) -> Result<Bytes> {
    let mut last_fault = None;
    for replica in locations {
        let Some(server) = conns.get(replica) else {
            continue;
        };
        match engine.read(server.as_ref(), key).await {
            Ok(payload) => return Ok(payload),
            Err(e) => {
                warn!("Reading chunk {} from {} failed: {}", key, replica, e);
                last_fault = Some(e);
            }
        }
    }
    Err(match last_fault {
        Some(TransferError::Remote(msg)) => Error::Remote(msg),
        _ => Error::NoReplicasAvailable(key.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_with_payloads_slices_in_order() {
        let data = Bytes::from_static(b"aaaabbbbcc");
        let mut placement = ChunkPlacement::new();
        placement.insert(ChunkKey::new("f", 2), vec!["3".into()]);
        placement.insert(ChunkKey::new("f", 0), vec!["1".into()]);
        placement.insert(ChunkKey::new("f", 1), vec!["2".into()]);

        let chunks = pair_with_payloads(placement, &data, 4).unwrap();
        let seen: Vec<_> = chunks
            .iter()
            .map(|(k, l, p)| (k.sequence, l[0].as_str(), p.as_ref()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (0, "1", &b"aaaa"[..]),
                (1, "2", &b"bbbb"[..]),
                (2, "3", &b"cc"[..])
            ]
        );
    }

    #[test]
    fn test_pair_with_payloads_rejects_short_allocation() {
        let data = Bytes::from_static(b"aaaabbbb");
        let mut placement = ChunkPlacement::new();
        placement.insert(ChunkKey::new("f", 0), vec!["1".into()]);
        assert!(matches!(
            pair_with_payloads(placement, &data, 4),
            Err(Error::Remote(_))
        ));
    }

    #[test]
    fn test_connections_skip_excluded() {
        let conns = Connections::default();
        conns.excluded.exclude("1");
        assert!(conns.get("1").is_none());
        assert!(conns.get("2").is_none());
    }

    #[tokio::test]
    async fn test_release_after_prefers_operation_error() {
        let memory = Arc::new(crate::coordination::MemoryCoordination::new());
        let lock = FileLock::acquire(memory.clone(), "f", Duration::from_secs(1))
            .await
            .unwrap();
        let res: Result<()> = release_after(lock, Err(Error::NotFound("f".into()))).await;
        assert!(matches!(res, Err(Error::NotFound(_))));
        assert!(!memory.is_locked(&coordination::file_lock_path("f")));
    }
}
