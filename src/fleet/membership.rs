//! Live chunkserver membership

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Registered chunkservers, ordinal to advertised address.
///
/// Each operation takes the lock once and never holds it across I/O.
#[derive(Debug, Default)]
pub struct MembershipTable {
    inner: Mutex<BTreeMap<String, String>>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a chunkserver, returning the address it replaced.
    pub fn register(&self, ordinal: &str, address: &str) -> Option<String> {
        self.entries()
            .insert(ordinal.to_string(), address.to_string())
    }

    /// Drop a chunkserver, returning its last known address.
    pub fn unregister(&self, ordinal: &str) -> Option<String> {
        self.entries().remove(ordinal)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries().clone()
    }

    pub fn contains(&self, ordinal: &str) -> bool {
        self.entries().contains_key(ordinal)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let table = MembershipTable::new();
        assert!(table.is_empty());

        assert_eq!(table.register("1", "tcp://10.0.0.1:4400"), None);
        assert_eq!(
            table.register("1", "tcp://10.0.0.9:4400").as_deref(),
            Some("tcp://10.0.0.1:4400")
        );
        table.register("2", "tcp://10.0.0.2:4400");
        assert_eq!(table.len(), 2);

        assert_eq!(
            table.unregister("1").as_deref(),
            Some("tcp://10.0.0.9:4400")
        );
        assert_eq!(table.unregister("1"), None);
        assert!(!table.contains("1"));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let table = MembershipTable::new();
        table.register("3", "a");
        let snap = table.snapshot();
        table.unregister("3");
        assert_eq!(snap.get("3").map(String::as_str), Some("a"));
        assert!(table.is_empty());
    }
}
