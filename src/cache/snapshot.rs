//! Immutable routing snapshots.
//!
//! A [`GroupSnapshot`] is built from one version of a group's config and
//! owns that version's routing state (cursor, WRR scores, connection
//! counters). Only the per-backend health flags change in place.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::group::{LbGroupConfig, SelectionAlgorithm};
use crate::health::state::HealthState;
use crate::load_balancer::{selector_for, LoadBalancer, RoutableBackend};
use crate::store::Version;

/// One group's routing view at one config version.
#[derive(Debug)]
pub struct GroupSnapshot {
    config: LbGroupConfig,
    store_version: Version,
    backends: Vec<Arc<RoutableBackend>>,
    selector: Box<dyn LoadBalancer>,
}

impl GroupSnapshot {
    /// Build from a validated config. Backends without a health entry start UNKNOWN.
    pub fn build(
        config: LbGroupConfig,
        store_version: Version,
        health: Option<&HashMap<String, HealthState>>,
    ) -> Self {
        let backends = config
            .backends
            .iter()
            .map(|b| {
                let state = health
                    .and_then(|h| h.get(&b.id))
                    .copied()
                    .unwrap_or_default();
                Arc::new(RoutableBackend::new(b, state))
            })
            .collect();
        let selector = selector_for(config.algorithm);

        Self {
            config,
            store_version,
            backends,
            selector,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn version(&self) -> u64 {
        self.config.version
    }

    pub fn store_version(&self) -> Version {
        self.store_version
    }

    pub fn algorithm(&self) -> SelectionAlgorithm {
        self.config.algorithm
    }

    pub fn config(&self) -> &LbGroupConfig {
        &self.config
    }

    /// All backends, in config order.
    pub fn backends(&self) -> &[Arc<RoutableBackend>] {
        &self.backends
    }

    pub fn backend(&self, id: &str) -> Option<&Arc<RoutableBackend>> {
        self.backends.iter().find(|b| b.id == id)
    }

    /// HEALTHY backends in config order.
    pub fn eligible(&self) -> Vec<Arc<RoutableBackend>> {
        self.backends
            .iter()
            .filter(|b| b.is_eligible())
            .cloned()
            .collect()
    }

    /// Run the group's algorithm over the eligible set.
    pub fn select(&self) -> Option<Arc<RoutableBackend>> {
        self.selector.next_server(&self.eligible())
    }

    /// Push health states in place. Missing entries become UNKNOWN.
    /// Returns the number of backends whose state changed.
    pub fn apply_health(&self, health: Option<&HashMap<String, HealthState>>) -> usize {
        self.backends
            .iter()
            .filter(|b| {
                let state = health
                    .and_then(|h| h.get(&b.id))
                    .copied()
                    .unwrap_or_default();
                b.set_health(state)
            })
            .count()
    }
}

/// Every group known to one node. Replaced as a whole, never mutated.
#[derive(Debug, Default)]
pub struct RoutingTable {
    groups: HashMap<String, Arc<GroupSnapshot>>,
}

impl RoutingTable {
    pub fn new(groups: HashMap<String, Arc<GroupSnapshot>>) -> Self {
        Self { groups }
    }

    pub fn group(&self, name: &str) -> Option<&Arc<GroupSnapshot>> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Arc<GroupSnapshot>> {
        self.groups.values()
    }

    /// Group names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
