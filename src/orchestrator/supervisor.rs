//! Leader-side shard supervisor.
//!
//! # Responsibilities
//! - While leading, keep every backend of every group assigned to exactly
//!   one live worker
//! - Rewrite shards when workers come and go or groups change
//! - Remove health records of backends that left the config
//!
//! # Design Decisions
//! - Every cycle recomputes the full partition; a new leader repairs any
//!   half-finished work of the previous one
//! - Shards are written with compare-and-set against the worker's own
//!   ephemeral record and never created, so a dead worker is never revived
//! - A rejected or regressed group record leaves the last valid config in
//!   charge; its health records are kept

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;

use crate::cache::config_cache::decode_group;
use crate::cache::ConfigCache;
use crate::config::group::LbGroupConfig;
use crate::config::schema::OrchestratorConfig;
use crate::health::load_health;
use crate::orchestrator::assignment::{compute_assignment, BackendKey, WorkerRecord};
use crate::orchestrator::election::LeadershipState;
use crate::orchestrator::OrchestratorError;
use crate::resilience::Backoff;
use crate::store::paths::{backend_health_path, segments_under, worker_path, LB_CONFIGS_PATH, WORKERS_PATH};
use crate::store::{
    get_json, wait_event, ExpectedVersion, StoreError, StoreHandle, WatchScope,
};

/// Outcome of one reconcile cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub workers: usize,
    pub backends: usize,
    /// Workers whose shard was rewritten.
    pub rewritten: Vec<String>,
    /// Health records removed because their backend left the config.
    pub removed_health: usize,
    /// Groups whose stored record was rejected this cycle.
    pub rejected: Vec<String>,
}

/// Groups to partition, plus the names whose health must be left alone.
struct GroupSet {
    configs: Vec<LbGroupConfig>,
    rejected: BTreeSet<String>,
}

/// Shard writer, active only on the leader.
#[derive(Debug)]
pub struct Supervisor {
    store: StoreHandle,
    config: OrchestratorConfig,
    cas_max_attempts: u32,
    /// Last accepted config per group.
    accepted: Mutex<HashMap<String, LbGroupConfig>>,
    /// Seeds `accepted` for groups first seen in a rejected state.
    cache: Option<Arc<ConfigCache>>,
}

impl Supervisor {
    pub fn new(store: StoreHandle, config: OrchestratorConfig, cas_max_attempts: u32) -> Self {
        Self {
            store,
            config,
            cas_max_attempts: cas_max_attempts.max(1),
            accepted: Mutex::new(HashMap::new()),
            cache: None,
        }
    }

    /// Fall back to the node's routing snapshot for groups this supervisor
    /// has never seen in a valid state.
    pub fn with_cache(mut self, cache: Arc<ConfigCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Follow `leadership`, supervising whenever this node leads.
    pub async fn run(
        &self,
        mut leadership: watch::Receiver<LeadershipState>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let leading = tokio::select! {
                res = leadership.wait_for(|s| s.is_leading()) => res.is_ok(),
                _ = shutdown.recv() => return,
            };
            if !leading {
                return;
            }

            tracing::info!("Supervisor active");
            if self.lead(&mut leadership, &mut shutdown).await {
                return;
            }
            tracing::info!("Supervisor standing down");
        }
    }

    /// Returns true on shutdown, false when leadership ends.
    async fn lead(
        &self,
        leadership: &mut watch::Receiver<LeadershipState>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        let interval = Duration::from_millis(self.config.reassign_interval_ms);
        let mut backoff = Backoff::new(100, interval.as_millis() as u64);

        loop {
            if !leadership.borrow().is_leading() {
                return false;
            }

            let workers_watch = self.store.watch(WORKERS_PATH, WatchScope::Prefix).await.ok();
            let configs_watch = self.store.watch(LB_CONFIGS_PATH, WatchScope::Prefix).await.ok();

            let delay = match self.reconcile().await {
                Ok(report) => {
                    backoff.reset();
                    if !report.rewritten.is_empty() || report.removed_health > 0 {
                        tracing::info!(
                            workers = report.workers,
                            backends = report.backends,
                            rewritten = ?report.rewritten,
                            removed_health = report.removed_health,
                            "Assignment reconciled"
                        );
                    }
                    interval
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Assignment reconcile failed");
                    delay
                }
            };

            tokio::select! {
                event = wait_event(workers_watch) => {
                    tracing::debug!(%event, "Worker set changed");
                }
                event = wait_event(configs_watch) => {
                    tracing::debug!(%event, "Group configs changed");
                }
                _ = sleep(delay) => {}
                res = leadership.changed() => {
                    if res.is_err() {
                        return false;
                    }
                }
                _ = shutdown.recv() => return true,
            }
        }
    }

    /// One full cycle: list, partition, write shards, clean health.
    pub async fn reconcile(&self) -> Result<ReconcileReport, OrchestratorError> {
        let workers = self.live_workers().await?;
        let GroupSet { configs, rejected } = self.groups().await?;

        let backends: Vec<BackendKey> = configs
            .iter()
            .flat_map(|g| g.backends.iter().map(|b| BackendKey::new(g.name.clone(), b.id.clone())))
            .collect();
        let configured: BTreeSet<&BackendKey> = backends.iter().collect();

        let worker_ids: Vec<&str> = workers.keys().map(String::as_str).collect();
        let plan = compute_assignment(&worker_ids, &backends, self.config.virtual_nodes);

        if worker_ids.is_empty() && !backends.is_empty() {
            tracing::warn!(backends = backends.len(), "No live workers, backends unmonitored");
        }

        let generation = workers.values().map(|w| w.generation).max().unwrap_or(0) + 1;
        let mut report = ReconcileReport {
            workers: workers.len(),
            backends: backends.len(),
            rejected: rejected.iter().cloned().collect(),
            ..ReconcileReport::default()
        };

        for (worker_id, shard) in plan {
            let unchanged = workers
                .get(&worker_id)
                .map(|record| record.assignment == shard)
                .unwrap_or(false);
            if unchanged {
                continue;
            }
            if self.write_shard(&worker_id, shard, generation).await? {
                report.rewritten.push(worker_id);
            }
        }

        for (key, (_, version)) in load_health(self.store.as_ref()).await? {
            if configured.contains(&key) || rejected.contains(&key.group) {
                continue;
            }
            let path = backend_health_path(&key.group, &key.backend_id);
            match self.store.delete(&path, ExpectedVersion::Exactly(version)).await {
                Ok(()) => {
                    tracing::info!(backend = %key, "Removed health record of deconfigured backend");
                    report.removed_health += 1;
                }
                Err(StoreError::NotFound(_)) | Err(StoreError::VersionConflict { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(report)
    }

    /// Registered workers by id.
    async fn live_workers(&self) -> Result<BTreeMap<String, WorkerRecord>, StoreError> {
        let mut workers = BTreeMap::new();
        for (path, versioned) in self.store.list(WORKERS_PATH).await? {
            let segments = segments_under(WORKERS_PATH, &path);
            let [worker_id] = segments.as_slice() else {
                continue;
            };
            match versioned.decode::<WorkerRecord>() {
                Ok(record) => {
                    workers.insert(worker_id.to_string(), record);
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Undecodable worker record, assigning as empty");
                    workers.insert(worker_id.to_string(), WorkerRecord::new(*worker_id));
                }
            }
        }
        Ok(workers)
    }

    /// Group configs to probe. A stored record replaces the accepted one
    /// only when it is valid and carries a higher version.
    async fn groups(&self) -> Result<GroupSet, StoreError> {
        let stored = self.store.list(LB_CONFIGS_PATH).await?;
        let mut accepted = self.accepted.lock();
        let mut present = BTreeSet::new();
        let mut rejected = BTreeSet::new();

        for (path, versioned) in stored {
            let segments = segments_under(LB_CONFIGS_PATH, &path);
            let [name] = segments.as_slice() else {
                continue;
            };
            let name = name.to_string();
            present.insert(name.clone());

            match decode_group(&name, &versioned) {
                Ok(group) => {
                    let newer = accepted.get(&name).map_or(true, |prev| group.version > prev.version);
                    if newer {
                        accepted.insert(name, group);
                    } else if accepted.get(&name).is_some_and(|prev| !prev.same_content(&group)) {
                        tracing::warn!(group = %name, version = group.version, "Ignoring group config without a higher version");
                    }
                }
                Err(errors) => {
                    tracing::warn!(group = %name, errors = ?errors, "Rejected group config, probing last valid version");
                    if !accepted.contains_key(&name) {
                        if let Some(snapshot) = self.cache.as_ref().and_then(|c| c.group(&name)) {
                            accepted.insert(name.clone(), snapshot.config().clone());
                        }
                    }
                    rejected.insert(name);
                }
            }
        }

        accepted.retain(|name, _| present.contains(name));
        Ok(GroupSet {
            configs: accepted.values().cloned().collect(),
            rejected,
        })
    }

    /// CAS the shard into the worker's record. Returns false if the worker is gone.
    async fn write_shard(
        &self,
        worker_id: &str,
        shard: BTreeSet<BackendKey>,
        generation: u64,
    ) -> Result<bool, StoreError> {
        let path = worker_path(worker_id);
        for attempt in 1..=self.cas_max_attempts {
            let Some((mut record, version)) = get_json::<WorkerRecord>(self.store.as_ref(), &path).await? else {
                return Ok(false);
            };
            record.worker_id = worker_id.to_string();
            record.assignment = shard.clone();
            record.generation = generation;

            match self
                .store
                .set(&path, serde_json::to_value(&record)?, ExpectedVersion::Exactly(version))
                .await
            {
                Ok(_) => {
                    tracing::debug!(worker = %worker_id, backends = shard.len(), generation, "Shard written");
                    return Ok(true);
                }
                Err(StoreError::VersionConflict { .. }) => {
                    tracing::debug!(worker = %worker_id, attempt, "Shard write conflict, retrying");
                }
                Err(StoreError::NotFound(_)) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::VersionConflict { path })
    }
}
