//! etcd-backed coordination
//!
//! Paths map to keys under `/<namespace>/`. Children are the keys one level
//! below a path prefix. File locks use etcd's lock service bound to a lease
//! that is kept alive while the lock is held and revoked on release, so a
//! crashed holder frees the lock once the TTL runs out.

use super::{CoordinationGateway, LockToken, NodeEvent};
use crate::common::{CoordinationConfig, Error, Result};
use async_trait::async_trait;
use etcd_client::{Client as EtcdClient, EventType, GetOptions, LockOptions, WatchOptions};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct EtcdCoordination {
    client: EtcdClient,
    namespace: String,
    lease_ttl: i64,
    keepers: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl EtcdCoordination {
    /// Connect to the ensemble. Failure here is reported as
    /// [`Error::CoordinationUnavailable`].
    pub async fn connect(config: &CoordinationConfig) -> Result<Self> {
        info!("Connecting to etcd at {:?}", config.endpoints);
        let client = EtcdClient::connect(&config.endpoints, None)
            .await
            .map_err(|e| Error::CoordinationUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            namespace: config.namespace.trim_matches('/').to_string(),
            lease_ttl: config.lock_lease_ttl_secs.max(1),
            keepers: Mutex::new(HashMap::new()),
        })
    }

    fn key(&self, path: &str) -> String {
        format!("/{}/{}", self.namespace, path.trim_matches('/'))
    }

    fn child_prefix(&self, path: &str) -> String {
        format!("{}/", self.key(path))
    }

    /// Children below `prefix` and the revision the listing was taken at.
    async fn list_children(client: &mut EtcdClient, prefix: &str) -> Result<(Vec<String>, i64)> {
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix().with_keys_only()))
            .await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);

        let children: BTreeSet<String> = resp
            .kvs()
            .iter()
            .filter_map(|kv| {
                let key = String::from_utf8_lossy(kv.key());
                let rest = key.strip_prefix(prefix)?;
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect();

        Ok((children.into_iter().collect(), revision))
    }

    fn keepers(&self) -> std::sync::MutexGuard<'_, HashMap<i64, JoinHandle<()>>> {
        self.keepers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn start_keep_alive(&self, lease: i64) -> Result<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease).await?;
        let period = Duration::from_secs((self.lease_ttl as u64 / 3).max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = keeper.keep_alive().await {
                    warn!("Lease {} keep-alive failed: {}", lease, e);
                    return;
                }
                match stream.message().await {
                    Ok(Some(_)) => {}
                    Ok(None) => return,
                    Err(e) => {
                        warn!("Lease {} keep-alive stream failed: {}", lease, e);
                        return;
                    }
                }
            }
        });
        self.keepers().insert(lease, handle);
        Ok(())
    }

    async fn revoke(&self, lease: i64) {
        if let Some(handle) = self.keepers().remove(&lease) {
            handle.abort();
        }
        let mut client = self.client.clone();
        if let Err(e) = client.lease_revoke(lease).await {
            warn!("Failed to revoke lease {}: {}", lease, e);
        }
    }
}

#[async_trait]
impl CoordinationGateway for EtcdCoordination {
    async fn ensure_path(&self, path: &str) -> Result<()> {
        if self.get(path).await?.is_none() {
            self.set(path, b"").await?;
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let resp = client.get(self.key(path), None).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn set(&self, path: &str, value: &[u8]) -> Result<()> {
        let mut client = self.client.clone();
        client.put(self.key(path), value.to_vec(), None).await?;
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let mut client = self.client.clone();
        let (children, _) = Self::list_children(&mut client, &self.child_prefix(path)).await?;
        Ok(children)
    }

    async fn watch_children(&self, path: &str) -> Result<mpsc::UnboundedReceiver<Vec<String>>> {
        let prefix = self.child_prefix(path);
        let mut client = self.client.clone();
        let (initial, revision) = Self::list_children(&mut client, &prefix).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(initial);

        tokio::spawn(async move {
            let mut start_revision = revision + 1;
            loop {
                let options = WatchOptions::new()
                    .with_prefix()
                    .with_start_revision(start_revision);
                let (_watcher, mut stream) = match client.watch(prefix.clone(), Some(options)).await
                {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("Failed to watch {}: {}", prefix, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                debug!("Watching children of {}", prefix);

                while let Some(resp) = stream.message().await.transpose() {
                    let resp = match resp {
                        Ok(resp) => resp,
                        Err(e) => {
                            warn!("Children watch on {} broke: {}", prefix, e);
                            break;
                        }
                    };
                    if resp.canceled() {
                        warn!("Children watch on {} canceled", prefix);
                        break;
                    }
                    if resp.events().is_empty() {
                        continue;
                    }

                    match Self::list_children(&mut client, &prefix).await {
                        Ok((children, revision)) => {
                            start_revision = revision + 1;
                            if tx.send(children).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("Failed to list children of {}: {}", prefix, e),
                    }
                }

                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });

        Ok(rx)
    }

    async fn watch_node(&self, path: &str) -> Result<oneshot::Receiver<NodeEvent>> {
        let key = self.key(path);
        let mut client = self.client.clone();
        let resp = client.get(key.clone(), None).await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);

        let options = WatchOptions::new().with_start_revision(revision + 1);
        let (watcher, mut stream) = client.watch(key.clone(), Some(options)).await?;

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            // Keep the watcher alive for as long as the stream is read.
            let _watcher = watcher;
            while let Some(resp) = stream.message().await.transpose() {
                let resp = match resp {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!("Node watch on {} broke: {}", key, e);
                        return;
                    }
                };
                if let Some(event) = resp.events().first() {
                    let node_event = match event.event_type() {
                        EventType::Put => NodeEvent::Changed(
                            event.kv().map(|kv| kv.value().to_vec()).unwrap_or_default(),
                        ),
                        EventType::Delete => NodeEvent::Deleted,
                    };
                    let _ = tx.send(node_event);
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn acquire_lock(&self, path: &str, timeout: Duration) -> Result<LockToken> {
        let mut client = self.client.clone();
        let lease = client.lease_grant(self.lease_ttl, None).await?.id();

        let name = self.key(path);
        let options = LockOptions::new().with_lease(lease);
        match tokio::time::timeout(timeout, client.lock(name, Some(options))).await {
            Ok(Ok(resp)) => {
                let token = LockToken {
                    path: path.to_string(),
                    key: resp.key().to_vec(),
                    lease: Some(lease),
                };
                if let Err(e) = self.start_keep_alive(lease).await {
                    warn!("Lock on {} held without keep-alive: {}", path, e);
                }
                Ok(token)
            }
            Ok(Err(e)) => {
                self.revoke(lease).await;
                Err(e.into())
            }
            Err(_) => {
                // A grant that lands after we gave up dies with the lease.
                self.revoke(lease).await;
                Err(Error::LockTimeout(path.to_string()))
            }
        }
    }

    async fn release_lock(&self, token: LockToken) -> Result<()> {
        let mut client = self.client.clone();
        let unlocked = client.unlock(token.key.clone()).await;
        if let Some(lease) = token.lease {
            self.revoke(lease).await;
        }
        unlocked?;
        Ok(())
    }
}
