//! Shared fakes for the integration tests: an in-memory master, scriptable
//! chunkservers and a recording provisioner.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use minigfs::chunk::ChunkKey;
use minigfs::client::ChunkIoClient;
use minigfs::common::{chunk_digest, ClientConfig, Error, Result};
use minigfs::coordination::{CoordinationGateway, MemoryCoordination};
use minigfs::fleet::Provisioner;
use minigfs::master::{
    ChunkAssignment, ChunkPlacement, ChunkserverDirectory, MasterContract, ReplicaChunks,
};
use minigfs::transfer::{ChunkServer, ChunkServerConnector, TransferError};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct FileMeta {
    pub version: u64,
    pub chunk_size: usize,
    pub chunks: ChunkPlacement,
}

#[derive(Default)]
struct MasterState {
    files: BTreeMap<String, FileMeta>,
    versions: HashMap<String, u64>,
    /// Allocations handed out by `allocate` and not yet committed
    pending: HashMap<String, usize>,
    add_file_calls: Vec<(String, ChunkAssignment)>,
    next_replica: usize,
}

/// Master that keeps everything in memory and places every chunk on
/// `replication` chunkservers, rotating through the directory.
pub struct FakeMaster {
    state: Mutex<MasterState>,
    directory: ChunkserverDirectory,
    replication: usize,
}

impl FakeMaster {
    pub fn new(directory: ChunkserverDirectory, replication: usize) -> Self {
        Self {
            state: Mutex::new(MasterState::default()),
            directory,
            replication,
        }
    }

    pub fn file(&self, name: &str) -> Option<FileMeta> {
        let state = self.state.lock().unwrap();
        state.files.get(name).cloned().map(|mut meta| {
            meta.version = state.versions.get(name).copied().unwrap_or(meta.version);
            meta
        })
    }

    pub fn add_file_calls(&self) -> Vec<(String, ChunkAssignment)> {
        self.state.lock().unwrap().add_file_calls.clone()
    }

    fn place(&self, state: &mut MasterState, name: &str, num: usize, seq: u64) -> ChunkPlacement {
        let ids: Vec<&String> = self.directory.keys().collect();
        let mut placement = ChunkPlacement::new();
        if ids.is_empty() {
            return placement;
        }
        for i in 0..num {
            let replicas = (0..self.replication.min(ids.len()))
                .map(|r| ids[(state.next_replica + r) % ids.len()].clone())
                .collect();
            state.next_replica += 1;
            placement.insert(ChunkKey::new(name, seq + i as u64), replicas);
        }
        placement
    }

    fn with_file<T>(&self, name: &str, f: impl FnOnce(&mut FileMeta) -> T) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        let meta = state
            .files
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        Ok(f(meta))
    }
}

#[async_trait]
impl MasterContract for FakeMaster {
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().files.contains_key(name))
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().files.keys().cloned().collect())
    }

    async fn update_version(&self, name: &str, version: u64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .versions
            .insert(name.to_string(), version);
        Ok(())
    }

    async fn allocate(
        &self,
        name: &str,
        num_chunks: usize,
        chunk_size: usize,
        first_sequence: u64,
    ) -> Result<ChunkPlacement> {
        let mut state = self.state.lock().unwrap();
        state.pending.insert(name.to_string(), chunk_size);
        Ok(self.place(&mut state, name, num_chunks, first_sequence))
    }

    async fn add_file(&self, name: &str, assignment: &ChunkAssignment) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .add_file_calls
            .push((name.to_string(), assignment.clone()));
        let chunk_size = state.pending.remove(name).unwrap_or(0);
        let chunks = assignment
            .iter()
            .map(|(key, replica)| (key.clone(), vec![replica.clone()]))
            .collect();
        state.files.insert(
            name.to_string(),
            FileMeta {
                version: 0,
                chunk_size,
                chunks,
            },
        );
        Ok(())
    }

    async fn chunk_ids(&self, name: &str) -> Result<Vec<ChunkKey>> {
        self.with_file(name, |meta| meta.chunks.keys().cloned().collect())
    }

    async fn file_chunks(&self, name: &str) -> Result<ChunkPlacement> {
        self.with_file(name, |meta| meta.chunks.clone())
    }

    async fn chunk_size(&self, name: &str) -> Result<usize> {
        self.with_file(name, |meta| meta.chunk_size)
    }

    async fn chunk_locations(&self, chunk: &ChunkKey) -> Result<Vec<String>> {
        self.with_file(&chunk.file, |meta| {
            meta.chunks.get(chunk).cloned().unwrap_or_default()
        })
    }

    async fn allocate_append(
        &self,
        num_chunks: usize,
        name: &str,
        first_sequence: u64,
    ) -> Result<ChunkPlacement> {
        let mut state = self.state.lock().unwrap();
        if !state.files.contains_key(name) {
            return Err(Error::NotFound(name.to_string()));
        }
        let placement = self.place(&mut state, name, num_chunks, first_sequence);
        if let Some(meta) = state.files.get_mut(name) {
            meta.chunks.extend(placement.clone());
        }
        Ok(placement)
    }

    async fn delete_chunks(&self, name: &str, chunks: &[ChunkKey]) -> Result<()> {
        self.with_file(name, |meta| {
            for chunk in chunks {
                meta.chunks.remove(chunk);
            }
        })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().files.remove(name);
        Ok(())
    }

    async fn rename(&self, placement: &ReplicaChunks, old: &str, new: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let meta = state
            .files
            .remove(old)
            .ok_or_else(|| Error::NotFound(old.to_string()))?;
        let moved: usize = placement.values().map(Vec::len).sum();
        assert!(moved >= meta.chunks.len(), "rename must cover every chunk");
        let chunks = meta
            .chunks
            .into_iter()
            .map(|(key, replicas)| (ChunkKey::new(new, key.sequence), replicas))
            .collect();
        state.files.insert(
            new.to_string(),
            FileMeta {
                version: meta.version,
                chunk_size: meta.chunk_size,
                chunks,
            },
        );
        Ok(())
    }

    async fn dump_metadata(&self) -> Result<Value> {
        let state = self.state.lock().unwrap();
        let files: BTreeMap<&String, usize> = state
            .files
            .iter()
            .map(|(name, meta)| (name, meta.chunks.len()))
            .collect();
        Ok(json!({ "files": files }))
    }

    async fn get(&self, key: &str) -> Result<Value> {
        match key {
            "chunkservers" => Ok(serde_json::to_value(&self.directory)?),
            _ => Ok(Value::Null),
        }
    }
}

/// Chunkserver holding chunks in memory, with knobs for failures.
pub struct FakeChunkServer {
    id: String,
    store: Mutex<HashMap<ChunkKey, Bytes>>,
    pub writes: AtomicUsize,
    pub reads: AtomicUsize,
    /// Refuses connections and every request
    pub unreachable: AtomicBool,
    /// Answers the probe but drops writes
    pub drop_writes: AtomicBool,
    /// Remaining writes answered with a wrong digest
    pub bad_digests: AtomicU32,
    read_delay: Mutex<Option<Arc<dyn Fn(&ChunkKey) -> Duration + Send + Sync>>>,
}

impl FakeChunkServer {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            store: Mutex::new(HashMap::new()),
            writes: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            unreachable: AtomicBool::new(false),
            drop_writes: AtomicBool::new(false),
            bad_digests: AtomicU32::new(0),
            read_delay: Mutex::new(None),
        }
    }

    pub fn set_read_delay(&self, f: impl Fn(&ChunkKey) -> Duration + Send + Sync + 'static) {
        *self.read_delay.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn holds(&self, key: &ChunkKey) -> bool {
        self.store.lock().unwrap().contains_key(key)
    }

    pub fn chunk_count(&self) -> usize {
        self.store.lock().unwrap().len()
    }
}

#[async_trait]
impl ChunkServer for FakeChunkServer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write(&self, chunk: &ChunkKey, payload: Bytes) -> std::result::Result<String, TransferError> {
        if self.unreachable.load(Ordering::SeqCst) || self.drop_writes.load(Ordering::SeqCst) {
            return Err(TransferError::Unreachable(self.id.clone()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let digest = chunk_digest(&payload);
        self.store.lock().unwrap().insert(chunk.clone(), payload);

        let corrupt = self
            .bad_digests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if corrupt {
            Ok("0000".to_string())
        } else {
            Ok(digest)
        }
    }

    async fn read(&self, chunk: &ChunkKey) -> std::result::Result<Bytes, TransferError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransferError::Unreachable(self.id.clone()));
        }
        let delay = self.read_delay.lock().unwrap().clone();
        if let Some(delay) = delay {
            tokio::time::sleep(delay(chunk)).await;
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.store
            .lock()
            .unwrap()
            .get(chunk)
            .cloned()
            .ok_or_else(|| TransferError::Remote(format!("{} has no chunk {}", self.id, chunk)))
    }

    async fn print_name(&self) -> std::result::Result<String, TransferError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransferError::Unreachable(self.id.clone()));
        }
        Ok(format!("fake-{}", self.id))
    }
}

pub struct FakeConnector {
    servers: HashMap<String, Arc<FakeChunkServer>>,
}

#[async_trait]
impl ChunkServerConnector for FakeConnector {
    async fn connect(
        &self,
        id: &str,
        _address: &str,
    ) -> std::result::Result<Arc<dyn ChunkServer>, TransferError> {
        let server = self
            .servers
            .get(id)
            .ok_or_else(|| TransferError::Unreachable(id.to_string()))?;
        server.print_name().await?;
        Ok(server.clone())
    }
}

/// Master, chunkservers and coordination wired together.
pub struct Cluster {
    pub master: Arc<FakeMaster>,
    pub servers: Vec<Arc<FakeChunkServer>>,
    pub coordination: Arc<MemoryCoordination>,
    connector: Arc<FakeConnector>,
}

impl Cluster {
    /// `n` chunkservers with ordinals "1".."n", each chunk allocated on
    /// `replication` of them.
    pub fn new(n: usize, replication: usize) -> Self {
        let servers: Vec<Arc<FakeChunkServer>> = (1..=n)
            .map(|i| Arc::new(FakeChunkServer::new(&i.to_string())))
            .collect();
        let directory = (1..=n)
            .map(|i| (i.to_string(), format!("tcp://10.0.0.{}:4400", i)))
            .collect();
        let connector = FakeConnector {
            servers: servers
                .iter()
                .map(|s| (s.id().to_string(), s.clone()))
                .collect(),
        };
        Self {
            master: Arc::new(FakeMaster::new(directory, replication)),
            servers,
            coordination: Arc::new(MemoryCoordination::new()),
            connector: Arc::new(connector),
        }
    }

    pub fn client(&self) -> ChunkIoClient {
        self.client_with(small_chunks())
    }

    pub fn client_with(&self, config: ClientConfig) -> ChunkIoClient {
        let gateway: Arc<dyn CoordinationGateway> = self.coordination.clone();
        ChunkIoClient::new(
            self.master.clone(),
            gateway,
            self.connector.clone(),
            &config,
        )
        .unwrap()
    }

    pub fn server(&self, id: &str) -> &Arc<FakeChunkServer> {
        self.servers.iter().find(|s| s.id() == id).unwrap()
    }

    pub fn total_writes(&self) -> usize {
        self.servers
            .iter()
            .map(|s| s.writes.load(Ordering::SeqCst))
            .sum()
    }
}

/// Client settings that split a few bytes into several chunks: chunk size is
/// `max(4, len / 4)`.
pub fn small_chunks() -> ClientConfig {
    ClientConfig {
        lock_timeout: "200ms".into(),
        target_chunks: 4,
        min_chunk_size: 4,
        ..Default::default()
    }
}

#[derive(Default)]
pub struct RecordingProvisioner {
    pub hosts: Mutex<Vec<String>>,
}

impl RecordingProvisioner {
    pub fn dispatched(&self) -> Vec<String> {
        self.hosts.lock().unwrap().clone()
    }
}

impl Provisioner for RecordingProvisioner {
    fn dispatch(&self, host: &str) -> Result<()> {
        self.hosts.lock().unwrap().push(host.to_string());
        Ok(())
    }
}

/// Poll `check` until it holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
