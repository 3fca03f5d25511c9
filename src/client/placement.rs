//! Replica candidates for a chunk write
//!
//! Each chunk walks its own [`ReplicaCandidates`] until a write succeeds or
//! the candidates run out. Replicas found unreachable go into one
//! [`ExcludedReplicas`] set shared by every chunk of the operation, so a dead
//! server is skipped by all chunks once any of them hit it.

use crate::common::ReplicaSelection;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct ExcludedReplicas {
    inner: Mutex<HashSet<String>>,
}

impl ExcludedReplicas {
    pub fn new(initial: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: Mutex::new(initial.into_iter().collect()),
        }
    }

    pub fn exclude(&self, replica: &str) {
        self.lock().insert(replica.to_string());
    }

    pub fn contains(&self, replica: &str) -> bool {
        self.lock().contains(replica)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Replicas to try for one chunk, in the order the selection policy gives.
/// Each replica is yielded at most once; excluded replicas are skipped at the
/// moment they would be yielded.
pub struct ReplicaCandidates<'a> {
    order: Vec<String>,
    pos: usize,
    excluded: &'a ExcludedReplicas,
}

impl<'a> ReplicaCandidates<'a> {
    pub fn new(
        locations: &[String],
        selection: ReplicaSelection,
        chunk_index: usize,
        excluded: &'a ExcludedReplicas,
    ) -> Self {
        let mut order = locations.to_vec();
        match selection {
            ReplicaSelection::RoundRobin if !order.is_empty() => {
                let start = chunk_index % order.len();
                order.rotate_left(start);
            }
            ReplicaSelection::Random => order.shuffle(&mut rand::thread_rng()),
            _ => {}
        }

        Self {
            order,
            pos: 0,
            excluded,
        }
    }
}

impl Iterator for ReplicaCandidates<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while self.pos < self.order.len() {
            let candidate = &self.order[self.pos];
            self.pos += 1;
            if !self.excluded.contains(candidate) {
                return Some(candidate.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locs(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_round_robin_starts_at_chunk_index() {
        let excluded = ExcludedReplicas::default();
        let locations = locs(&["a", "b", "c"]);

        let first: Vec<_> =
            ReplicaCandidates::new(&locations, ReplicaSelection::RoundRobin, 0, &excluded).collect();
        assert_eq!(first, locs(&["a", "b", "c"]));

        let fifth: Vec<_> =
            ReplicaCandidates::new(&locations, ReplicaSelection::RoundRobin, 4, &excluded).collect();
        assert_eq!(fifth, locs(&["b", "c", "a"]));
    }

    #[test]
    fn test_primary_first_ignores_index() {
        let excluded = ExcludedReplicas::default();
        let locations = locs(&["a", "b"]);
        let order: Vec<_> =
            ReplicaCandidates::new(&locations, ReplicaSelection::PrimaryFirst, 7, &excluded)
                .collect();
        assert_eq!(order, locations);
    }

    #[test]
    fn test_random_yields_each_once() {
        let excluded = ExcludedReplicas::default();
        let locations = locs(&["a", "b", "c", "d"]);
        let mut order: Vec<_> =
            ReplicaCandidates::new(&locations, ReplicaSelection::Random, 0, &excluded).collect();
        order.sort();
        assert_eq!(order, locations);
    }

    #[test]
    fn test_exclusions_apply_while_iterating() {
        let excluded = ExcludedReplicas::new(vec!["a".to_string()]);
        let locations = locs(&["a", "b", "c"]);
        let mut candidates =
            ReplicaCandidates::new(&locations, ReplicaSelection::PrimaryFirst, 0, &excluded);

        assert_eq!(candidates.next().as_deref(), Some("b"));
        // Another chunk found "c" dead in the meantime.
        excluded.exclude("c");
        assert_eq!(candidates.next(), None);
    }

    #[test]
    fn test_empty_locations() {
        let excluded = ExcludedReplicas::default();
        let mut candidates =
            ReplicaCandidates::new(&[], ReplicaSelection::RoundRobin, 3, &excluded);
        assert_eq!(candidates.next(), None);
    }
}
