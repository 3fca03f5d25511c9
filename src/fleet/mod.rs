//! Fleet watcher
//!
//! Tracks the chunkservers registered under the chunkserver path of the
//! coordination service. A chunkserver first creates its node, then writes
//! its advertised address into it:
//!
//! ```text
//!  Discovered ──(address present)──────────────► Registered ──(node gone)──► Removed
//!      │                                             ▲                          │
//!      └──(empty)──► WaitingOnAddress ──(written)────┘                   provision a
//!                          │                                             replacement
//!                          └──(node gone)──► dropped
//! ```
//!
//! Coordination watches are forwarded into one channel of [`FleetEvent`]s.
//! A single task consumes it and is the only writer of the
//! [`MembershipTable`].

pub mod membership;
pub mod provision;

pub use membership::MembershipTable;
pub use provision::{Provisioner, SshProvisioner};

use crate::common::{detect_local_ip, normalize_address, Error, Result, WatcherConfig};
use crate::coordination::{CoordinationGateway, NodeEvent, MASTER_PATH, WATCHER_PATH};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    /// Fresh children list of the chunkserver path
    Children(Vec<String>),
    /// A waiting chunkserver's node changed
    AddressPublished { ordinal: String, event: NodeEvent },
}

/// Handle to a running fleet watcher.
pub struct FleetHandle {
    table: Arc<MembershipTable>,
    address: String,
    master_address: String,
    task: JoinHandle<()>,
}

impl FleetHandle {
    /// Registered chunkservers, ordinal to address.
    pub fn chunkservers(&self) -> BTreeMap<String, String> {
        self.table.snapshot()
    }

    pub fn table(&self) -> &Arc<MembershipTable> {
        &self.table
    }

    /// Address this watcher advertised under `watcher`
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn master_address(&self) -> &str {
        &self.master_address
    }

    /// Wait for the event task. It only ends when the watches close.
    pub async fn join(&mut self) -> Result<()> {
        (&mut self.task)
            .await
            .map_err(|e| Error::Internal(format!("fleet watcher task: {}", e)))
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

pub struct FleetWatcher {
    gateway: Arc<dyn CoordinationGateway>,
    provisioner: Arc<dyn Provisioner>,
    table: Arc<MembershipTable>,
    chunkserver_path: String,
    /// Nodes seen without an address yet
    pending: HashSet<String>,
    events: mpsc::UnboundedSender<FleetEvent>,
}

impl FleetWatcher {
    /// Advertise the watcher, look up the master and start following the
    /// chunkserver registrations.
    pub async fn start(
        gateway: Arc<dyn CoordinationGateway>,
        provisioner: Arc<dyn Provisioner>,
        config: &WatcherConfig,
    ) -> Result<FleetHandle> {
        let host = match &config.advertise_host {
            Some(host) => host.clone(),
            None => detect_local_ip()?.to_string(),
        };
        let address = format!("tcp://{}:{}", host, config.port);
        gateway.ensure_path(WATCHER_PATH).await?;
        gateway.set(WATCHER_PATH, address.as_bytes()).await?;
        info!("Advertised watcher at {}", address);

        let master = gateway
            .get(MASTER_PATH)
            .await?
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::CoordinationUnavailable("no master registered".into()))?;
        let master = String::from_utf8_lossy(&master);
        let master_address = master.rsplit('@').next().unwrap_or_default().to_string();
        info!("Master is at {}", master_address);

        let path = config.chunkserver_path.trim_matches('/').to_string();
        gateway.ensure_path(&path).await?;
        let mut children = gateway.watch_children(&path).await?;

        let (events, mut rx) = mpsc::unbounded_channel();
        let forward = events.clone();
        tokio::spawn(async move {
            while let Some(list) = children.recv().await {
                if forward.send(FleetEvent::Children(list)).is_err() {
                    break;
                }
            }
            debug!("Chunkserver children watch closed");
        });

        let table = Arc::new(MembershipTable::new());
        let mut watcher = FleetWatcher {
            gateway,
            provisioner,
            table: table.clone(),
            chunkserver_path: path,
            pending: HashSet::new(),
            events,
        };
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                watcher.handle(event).await;
            }
        });

        Ok(FleetHandle {
            table,
            address,
            master_address,
            task,
        })
    }

    async fn handle(&mut self, event: FleetEvent) {
        match event {
            FleetEvent::Children(children) => self.on_children(children).await,
            FleetEvent::AddressPublished { ordinal, event } => {
                self.on_address(ordinal, event).await
            }
        }
    }

    async fn on_children(&mut self, children: Vec<String>) {
        let current: HashSet<String> = children.into_iter().collect();

        let departed: Vec<String> = self
            .table
            .snapshot()
            .into_keys()
            .filter(|ordinal| !current.contains(ordinal))
            .collect();
        for ordinal in departed {
            self.remove(&ordinal);
        }

        self.pending.retain(|ordinal| {
            let alive = current.contains(ordinal);
            if !alive {
                debug!("Chunkserver {} left before publishing an address", ordinal);
            }
            alive
        });

        let mut joined: Vec<String> = current
            .into_iter()
            .filter(|ordinal| !self.table.contains(ordinal) && !self.pending.contains(ordinal))
            .collect();
        joined.sort();
        if !joined.is_empty() {
            info!("New chunkserver(s) detected: {:?}", joined);
        }
        for ordinal in &joined {
            if let Err(e) = self.discover(ordinal).await {
                warn!("Failed to follow chunkserver {}: {}", ordinal, e);
            }
        }
    }

    async fn on_address(&mut self, ordinal: String, event: NodeEvent) {
        if !self.pending.contains(&ordinal) {
            return;
        }
        match event {
            NodeEvent::Changed(value) if !value.is_empty() => {
                self.pending.remove(&ordinal);
                self.register(&ordinal, &value);
            }
            NodeEvent::Changed(_) => {
                self.pending.remove(&ordinal);
                if let Err(e) = self.discover(&ordinal).await {
                    warn!("Failed to follow chunkserver {}: {}", ordinal, e);
                }
            }
            NodeEvent::Deleted => {
                self.pending.remove(&ordinal);
                debug!("Chunkserver {} removed while waiting on its address", ordinal);
            }
        }
    }

    /// Register the node if its address is published, otherwise wait for it.
    async fn discover(&mut self, ordinal: &str) -> Result<()> {
        let path = format!("{}/{}", self.chunkserver_path, ordinal);
        // Armed before the read so an address written in between still fires.
        let watch = self.gateway.watch_node(&path).await?;

        match self.gateway.get(&path).await? {
            Some(value) if !value.is_empty() => self.register(ordinal, &value),
            Some(_) => {
                debug!("Chunkserver {} has no address yet, waiting", ordinal);
                self.pending.insert(ordinal.to_string());
                let events = self.events.clone();
                let ordinal = ordinal.to_string();
                tokio::spawn(async move {
                    if let Ok(event) = watch.await {
                        let _ = events.send(FleetEvent::AddressPublished { ordinal, event });
                    }
                });
            }
            None => debug!("Chunkserver {} vanished before discovery", ordinal),
        }
        Ok(())
    }

    fn register(&self, ordinal: &str, value: &[u8]) {
        let address = String::from_utf8_lossy(value).trim().to_string();
        info!("Registering chunkserver {} at {}", ordinal, address);
        self.table.register(ordinal, &address);
    }

    fn remove(&self, ordinal: &str) {
        let Some(address) = self.table.unregister(ordinal) else {
            return;
        };
        info!("Chunkserver {} was removed", ordinal);

        let host = normalize_address(&address);
        match self.provisioner.dispatch(&host) {
            Ok(()) => info!("Provisioning a replacement for {} on {}", ordinal, host),
            Err(e) => error!(
                "Failed to provision a replacement for {} on {}: {}",
                ordinal, host, e
            ),
        }
    }
}
