//! Probe-work partitioning.
//!
//! Backends are placed on a consistent-hash ring with `virtual_nodes`
//! points per worker. Adding or removing a worker only moves the keys on
//! that worker's arcs, so surviving workers keep most of their shard.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

pub use crate::health::state::BackendKey;

/// Payload of `/orchestrator/workers/<workerId>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkerRecord {
    pub worker_id: String,

    /// Backends this worker probes.
    #[serde(default)]
    pub assignment: BTreeSet<BackendKey>,

    /// Stamped by the leader on every shard write.
    #[serde(default)]
    pub generation: u64,
}

impl WorkerRecord {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            assignment: BTreeSet::new(),
            generation: 0,
        }
    }
}

/// Hash a string to u64 (first 8 bytes of SHA-256).
fn hash_key(s: &str) -> u64 {
    let digest = Sha256::digest(s.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[0..8]);
    u64::from_be_bytes(bytes)
}

/// Consistent-hash ring over worker ids.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    ring: BTreeMap<u64, String>,
}

impl HashRing {
    pub fn new<S: AsRef<str>>(workers: &[S], virtual_nodes: usize) -> Self {
        let mut ring = BTreeMap::new();
        for worker in workers {
            let worker = worker.as_ref();
            for vnode in 0..virtual_nodes.max(1) {
                // On a (vanishingly rare) point collision the lower id wins,
                // independent of insertion order.
                ring.entry(hash_key(&format!("{}#{}", worker, vnode)))
                    .and_modify(|owner: &mut String| {
                        if worker < owner.as_str() {
                            *owner = worker.to_string();
                        }
                    })
                    .or_insert_with(|| worker.to_string());
            }
        }
        Self { ring }
    }

    /// First point at or after the key's hash, wrapping around.
    pub fn owner(&self, key: &str) -> Option<&str> {
        let h = hash_key(key);
        self.ring
            .range(h..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, worker)| worker.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// Partition `backends` across `workers`.
///
/// Deterministic for a given input. Every worker gets an entry, possibly
/// empty; every backend appears in exactly one shard. With no workers the
/// result is empty.
pub fn compute_assignment<S: AsRef<str>>(
    workers: &[S],
    backends: &[BackendKey],
    virtual_nodes: usize,
) -> BTreeMap<String, BTreeSet<BackendKey>> {
    let mut plan: BTreeMap<String, BTreeSet<BackendKey>> = workers
        .iter()
        .map(|w| (w.as_ref().to_string(), BTreeSet::new()))
        .collect();

    let ring = HashRing::new(workers, virtual_nodes);
    for key in backends {
        if let Some(owner) = ring.owner(&key.to_string()) {
            if let Some(shard) = plan.get_mut(owner) {
                shard.insert(key.clone());
            }
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<BackendKey> {
        (0..n)
            .map(|i| BackendKey::new(format!("g{}", i % 4), format!("b{}", i)))
            .collect()
    }

    fn owner_of(plan: &BTreeMap<String, BTreeSet<BackendKey>>, key: &BackendKey) -> String {
        plan.iter()
            .find(|(_, shard)| shard.contains(key))
            .map(|(w, _)| w.clone())
            .unwrap()
    }

    #[test]
    fn test_each_key_exactly_once() {
        let backends = keys(200);
        let plan = compute_assignment(&["w1", "w2", "w3"], &backends, 64);
        let total: usize = plan.values().map(|s| s.len()).sum();
        assert_eq!(total, 200);
        let union: BTreeSet<&BackendKey> = plan.values().flatten().collect();
        assert_eq!(union.len(), 200);
    }

    #[test]
    fn test_deterministic_regardless_of_worker_order() {
        let backends = keys(100);
        let a = compute_assignment(&["w1", "w2", "w3"], &backends, 64);
        let b = compute_assignment(&["w3", "w1", "w2"], &backends, 64);
        assert_eq!(a, b);
    }

    #[test]
    fn test_removing_worker_only_moves_its_keys() {
        let backends = keys(300);
        let before = compute_assignment(&["w1", "w2", "w3"], &backends, 64);
        let after = compute_assignment(&["w1", "w3"], &backends, 64);

        for key in &backends {
            let old = owner_of(&before, key);
            let new = owner_of(&after, key);
            if old != "w2" {
                assert_eq!(old, new, "{} moved without cause", key);
            }
        }
        assert!(after.values().flatten().count() == 300);
    }

    #[test]
    fn test_reasonable_balance() {
        let backends = keys(1_000);
        let plan = compute_assignment(&["w1", "w2", "w3", "w4"], &backends, 128);
        for shard in plan.values() {
            assert!(shard.len() > 150 && shard.len() < 350, "shard size {}", shard.len());
        }
    }

    #[test]
    fn test_no_workers() {
        let plan = compute_assignment::<&str>(&[], &keys(5), 64);
        assert!(plan.is_empty());
    }
}
