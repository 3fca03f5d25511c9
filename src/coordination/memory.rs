//! In-process coordination namespace
//!
//! Keeps the node tree, watches and locks in one mutex-guarded map. Used for
//! single-process deployments and as the ensemble in tests, where
//! [`MemoryCoordination::create`] and [`MemoryCoordination::delete`] play the
//! part of chunkservers registering and disappearing.

use super::{CoordinationGateway, LockToken, NodeEvent};
use crate::common::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Vec<u8>>,
    child_watches: Vec<(String, mpsc::UnboundedSender<Vec<String>>)>,
    node_watches: HashMap<String, Vec<oneshot::Sender<NodeEvent>>>,
    locks: HashMap<String, Vec<u8>>,
}

impl State {
    fn children(&self, parent: &str) -> Vec<String> {
        let prefix = format!("{}/", parent);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, _)| {
                let rest = &path[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn notify_node(&mut self, path: &str, event: NodeEvent) {
        if let Some(watches) = self.node_watches.remove(path) {
            for tx in watches {
                let _ = tx.send(event.clone());
            }
        }
    }

    fn notify_parent(&mut self, path: &str) {
        let Some((parent, _)) = path.rsplit_once('/') else {
            return;
        };
        let children = self.children(parent);
        self.child_watches
            .retain(|(watched, tx)| watched != parent || tx.send(children.clone()).is_ok());
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

#[derive(Default)]
pub struct MemoryCoordination {
    state: Mutex<State>,
    lock_released: Notify,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create or overwrite a node, firing node and children watches.
    pub fn create(&self, path: &str, value: &[u8]) {
        let path = normalize(path);
        let mut state = self.state();
        let is_new = state.nodes.insert(path.clone(), value.to_vec()).is_none();
        state.notify_node(&path, NodeEvent::Changed(value.to_vec()));
        if is_new {
            state.notify_parent(&path);
        }
    }

    /// Remove a node, firing node and children watches.
    pub fn delete(&self, path: &str) {
        let path = normalize(path);
        let mut state = self.state();
        if state.nodes.remove(&path).is_some() {
            state.notify_node(&path, NodeEvent::Deleted);
            state.notify_parent(&path);
        }
    }

    pub fn is_locked(&self, path: &str) -> bool {
        self.state().locks.contains_key(&normalize(path))
    }

    fn try_lock(&self, path: &str) -> Option<LockToken> {
        let mut state = self.state();
        if state.locks.contains_key(path) {
            return None;
        }
        let key = uuid::Uuid::new_v4().as_bytes().to_vec();
        state.locks.insert(path.to_string(), key.clone());
        Some(LockToken {
            path: path.to_string(),
            key,
            lease: None,
        })
    }
}

#[async_trait]
impl CoordinationGateway for MemoryCoordination {
    async fn ensure_path(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut state = self.state();
        if !state.nodes.contains_key(&path) {
            state.nodes.insert(path.clone(), Vec::new());
            state.notify_parent(&path);
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state().nodes.get(&normalize(path)).cloned())
    }

    async fn set(&self, path: &str, value: &[u8]) -> Result<()> {
        self.create(path, value);
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        Ok(self.state().children(&normalize(path)))
    }

    async fn watch_children(&self, path: &str) -> Result<mpsc::UnboundedReceiver<Vec<String>>> {
        let path = normalize(path);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        let current = state.children(&path);
        tx.send(current)
            .map_err(|_| Error::Internal("children watch closed".into()))?;
        state.child_watches.push((path, tx));
        Ok(rx)
    }

    async fn watch_node(&self, path: &str) -> Result<oneshot::Receiver<NodeEvent>> {
        let (tx, rx) = oneshot::channel();
        self.state()
            .node_watches
            .entry(normalize(path))
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn acquire_lock(&self, path: &str, timeout: Duration) -> Result<LockToken> {
        let path = normalize(path);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Registered before the check so a release in between is not missed.
            let released = self.lock_released.notified();
            if let Some(token) = self.try_lock(&path) {
                return Ok(token);
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(Error::LockTimeout(path));
            }
        }
    }

    async fn release_lock(&self, token: LockToken) -> Result<()> {
        {
            let mut state = self.state();
            match state.locks.get(&token.path) {
                Some(key) if *key == token.key => {
                    state.locks.remove(&token.path);
                }
                _ => {
                    return Err(Error::Coordination(format!(
                        "lock {} not held by this token",
                        token.path
                    )))
                }
            }
        }
        self.lock_released.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_get_set_and_children() {
        let coord = MemoryCoordination::new();
        coord.ensure_path("chunkserver").await.unwrap();
        coord.set("chunkserver/1", b"tcp://a:1").await.unwrap();
        coord.set("chunkserver/2", b"").await.unwrap();
        coord.set("chunkserver/2/deep", b"x").await.unwrap();
        coord.set("chunkservers", b"sibling").await.unwrap();

        let mut children = coord.children("chunkserver").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["1", "2"]);
        assert_eq!(
            coord.get("/chunkserver/1/").await.unwrap(),
            Some(b"tcp://a:1".to_vec())
        );
        assert_eq!(coord.get("chunkserver/9").await.unwrap(), None);

        // ensure_path keeps an existing value
        coord.ensure_path("chunkserver/1").await.unwrap();
        assert_eq!(
            coord.get("chunkserver/1").await.unwrap(),
            Some(b"tcp://a:1".to_vec())
        );
    }

    #[tokio::test]
    async fn test_children_watch() {
        let coord = MemoryCoordination::new();
        coord.create("chunkserver/1", b"x");
        let mut rx = coord.watch_children("chunkserver").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec!["1"]);

        coord.create("chunkserver/2", b"y");
        assert_eq!(rx.recv().await.unwrap(), vec!["1", "2"]);

        // Value updates are not membership changes.
        coord.create("chunkserver/2", b"z");
        coord.delete("chunkserver/1");
        assert_eq!(rx.recv().await.unwrap(), vec!["2"]);
    }

    #[tokio::test]
    async fn test_node_watch_fires_once() {
        let coord = MemoryCoordination::new();
        coord.create("chunkserver/3", b"");
        let rx = coord.watch_node("chunkserver/3").await.unwrap();

        coord.create("chunkserver/3", b"tcp://h:1");
        assert_eq!(rx.await.unwrap(), NodeEvent::Changed(b"tcp://h:1".to_vec()));

        let rx = coord.watch_node("chunkserver/3").await.unwrap();
        coord.delete("chunkserver/3");
        assert_eq!(rx.await.unwrap(), NodeEvent::Deleted);
    }

    #[tokio::test]
    async fn test_lock_waits_for_release() {
        let coord = Arc::new(MemoryCoordination::new());
        let token = coord
            .acquire_lock("files/a", Duration::from_secs(1))
            .await
            .unwrap();

        let waiter = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.acquire_lock("files/a", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        coord.release_lock(token).await.unwrap();
        let second = waiter.await.unwrap().unwrap();
        assert!(coord.is_locked("files/a"));
        coord.release_lock(second).await.unwrap();
        assert!(!coord.is_locked("files/a"));
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let coord = MemoryCoordination::new();
        let _held = coord
            .acquire_lock("files/a", Duration::from_secs(1))
            .await
            .unwrap();
        let res = coord.acquire_lock("files/a", Duration::from_millis(10)).await;
        assert!(matches!(res, Err(Error::LockTimeout(_))));

        // Other files are independent.
        assert!(coord
            .acquire_lock("files/b", Duration::from_millis(10))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_release_with_stale_token_fails() {
        let coord = MemoryCoordination::new();
        let token = coord
            .acquire_lock("files/a", Duration::from_secs(1))
            .await
            .unwrap();
        let mut stale = token.clone();
        stale.key = vec![0; 16];
        assert!(coord.release_lock(stale).await.is_err());
        assert!(coord.release_lock(token).await.is_ok());
    }
}
