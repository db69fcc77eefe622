//! Fleet address resolution.
//!
//! # Responsibilities
//! - Keep a snapshot of registered LB nodes
//! - Optionally keep only nodes the orchestrator reports HEALTHY
//! - Answer `resolve(locality)` with an ordered, bounded address list
//!
//! # Design Decisions
//! - Same watch / refresh / reconcile loop as the config cache
//! - Ordering is local-first, then weight, then node id, so answers are
//!   stable between refreshes

use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::config::schema::{DiscoveryConfig, StoreConfig};
use crate::discovery::registry::LbNodeRecord;
use crate::health::{BackendHealthRecord, HealthState};
use crate::resilience::Backoff;
use crate::store::paths::{group_health_path, segments_under, LB_NODES_PATH};
use crate::store::{wait_event, StoreError, StoreHandle, WatchScope};

/// One entry of a discovery answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAddress {
    pub address: String,
    pub weight: u32,
}

/// Order `nodes` for a client in `locality` and keep at most `max_results`.
pub fn rank_nodes(nodes: &[LbNodeRecord], locality: Option<&str>, max_results: usize) -> Vec<ResolvedAddress> {
    let mut ranked: Vec<&LbNodeRecord> = nodes.iter().collect();
    ranked.sort_by(|a, b| {
        let a_local = locality.is_some() && a.locality.as_deref() == locality;
        let b_local = locality.is_some() && b.locality.as_deref() == locality;
        b_local
            .cmp(&a_local)
            .then_with(|| b.weight.cmp(&a.weight))
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    ranked
        .into_iter()
        .take(max_results)
        .map(|n| ResolvedAddress {
            address: n.address.clone(),
            weight: n.weight,
        })
        .collect()
}

/// Discovery view of the load-balancer fleet.
#[derive(Debug)]
pub struct Resolver {
    store: StoreHandle,
    fleet_group: Option<String>,
    max_results: usize,
    reconcile_interval: Duration,
    retry_base_ms: u64,
    retry_max_ms: u64,
    nodes: ArcSwap<Vec<LbNodeRecord>>,
}

impl Resolver {
    pub fn new(store: StoreHandle, config: &DiscoveryConfig, retry: &StoreConfig) -> Self {
        Self {
            store,
            fleet_group: config.fleet_group.clone(),
            max_results: config.max_results.max(1),
            reconcile_interval: Duration::from_millis(config.reconcile_interval_ms),
            retry_base_ms: retry.retry_base_delay_ms,
            retry_max_ms: retry.retry_max_delay_ms,
            nodes: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Current candidate nodes.
    pub fn nodes(&self) -> Arc<Vec<LbNodeRecord>> {
        self.nodes.load_full()
    }

    pub fn resolve(&self, locality: Option<&str>) -> Vec<ResolvedAddress> {
        rank_nodes(&self.nodes.load(), locality, self.max_results)
    }

    /// Rebuild the node snapshot. Returns the number of candidates.
    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let mut nodes = Vec::new();
        for (path, versioned) in self.store.list(LB_NODES_PATH).await? {
            if segments_under(LB_NODES_PATH, &path).len() != 1 {
                continue;
            }
            match versioned.decode::<LbNodeRecord>() {
                Ok(node) => nodes.push(node),
                Err(e) => tracing::warn!(path = %path, error = %e, "Skipping undecodable node record"),
            }
        }

        if let Some(group) = &self.fleet_group {
            let healthy: HashSet<String> = self
                .store
                .list(&group_health_path(group))
                .await?
                .into_iter()
                .filter_map(|(_, v)| v.decode::<BackendHealthRecord>().ok())
                .filter(|r| r.state == HealthState::Healthy)
                .map(|r| r.backend_id)
                .collect();
            nodes.retain(|n| healthy.contains(&n.node_id));
        }

        let count = nodes.len();
        self.nodes.store(Arc::new(nodes));
        Ok(count)
    }

    /// Watch / refresh / re-watch until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = Backoff::new(self.retry_base_ms, self.retry_max_ms);
        let health_path = self.fleet_group.as_deref().map(group_health_path);

        loop {
            let nodes_watch = self.store.watch(LB_NODES_PATH, WatchScope::Prefix).await.ok();
            let health_watch = match &health_path {
                Some(path) => self.store.watch(path, WatchScope::Prefix).await.ok(),
                None => None,
            };

            let delay = match self.refresh().await {
                Ok(count) => {
                    backoff.reset();
                    tracing::debug!(nodes = count, "Fleet snapshot refreshed");
                    self.reconcile_interval
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Fleet refresh failed, serving last snapshot");
                    delay
                }
            };

            tokio::select! {
                _ = wait_event(nodes_watch) => {}
                _ = wait_event(health_watch) => {}
                _ = sleep(delay) => {}
                _ = shutdown.recv() => {
                    tracing::info!("Resolver received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
