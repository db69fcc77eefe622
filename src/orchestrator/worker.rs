//! Probe worker.
//!
//! # Responsibilities
//! - Register `/orchestrator/workers/<id>` and follow the shard the leader
//!   writes into it
//! - Probe every due backend of the shard with bounded concurrency
//! - Persist health transitions with compare-and-set
//!
//! # Design Decisions
//! - The last-known shard keeps being probed while there is no leader
//! - Trackers re-sync from `/health` before each round, so an external
//!   DRAINING or undrain is observed by the owner
//! - A conflicting write never overwrites DRAINING
//! - A transition that could not be written stays dirty and is retried on
//!   the next tick

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{self, sleep, Instant, MissedTickBehavior};

use crate::cache::{ConfigCache, RoutingTable};
use crate::config::schema::OrchestratorConfig;
use crate::health::state::now_millis;
use crate::health::{
    load_health, BackendHealthRecord, HealthProbe, HealthState, ProbeError, ProbeOutcome,
};
use crate::observability::metrics;
use crate::orchestrator::assignment::{BackendKey, WorkerRecord};
use crate::orchestrator::OrchestratorError;
use crate::resilience::Backoff;
use crate::store::paths::{backend_health_path, worker_path};
use crate::store::{
    get_json, wait_event, CoordinationStore, ExpectedVersion, Session, StoreError, Version,
    WatchScope,
};

/// Externally visible worker state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub registered: bool,
    pub generation: u64,
    pub assigned: usize,
    /// Unix millis of the last completed probe round.
    pub last_round_ms: u64,
}

#[derive(Debug)]
struct Tracker {
    record: BackendHealthRecord,
    /// Store version of the record, `None` if not (known to be) stored.
    version: Option<Version>,
    /// Not yet reconciled with `/health`.
    fresh: bool,
    /// In-memory state differs from the store.
    dirty: bool,
    next_due: Instant,
}

impl Tracker {
    fn new(key: &BackendKey, now: Instant) -> Self {
        Self {
            record: BackendHealthRecord::new(key.group.clone(), key.backend_id.clone()),
            version: None,
            fresh: true,
            dirty: false,
            next_due: now,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stop {
    Shutdown,
    SessionLost,
}

/// One orchestrator worker.
pub struct Worker {
    worker_id: String,
    session: Arc<Session>,
    cache: Arc<ConfigCache>,
    probe: Arc<dyn HealthProbe>,
    config: OrchestratorConfig,
    cas_max_attempts: u32,
    assignment: BTreeSet<BackendKey>,
    generation: u64,
    trackers: HashMap<BackendKey, Tracker>,
    status_tx: watch::Sender<WorkerStatus>,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<String>,
        session: Arc<Session>,
        cache: Arc<ConfigCache>,
        probe: Arc<dyn HealthProbe>,
        config: OrchestratorConfig,
        cas_max_attempts: u32,
    ) -> Self {
        let worker_id = worker_id.into();
        let (status_tx, _) = watch::channel(WorkerStatus {
            worker_id: worker_id.clone(),
            ..WorkerStatus::default()
        });
        Self {
            worker_id,
            session,
            cache,
            probe,
            config,
            cas_max_attempts: cas_max_attempts.max(1),
            assignment: BTreeSet::new(),
            generation: 0,
            trackers: HashMap::new(),
            status_tx,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status_tx.subscribe()
    }

    /// Backends currently assigned to this worker.
    pub fn assignment(&self) -> &BTreeSet<BackendKey> {
        &self.assignment
    }

    /// Run until shutdown (`Ok`) or until the worker's session is lost.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), OrchestratorError> {
        if !self.register(&mut shutdown).await? {
            return Ok(());
        }

        let session = self.session.clone();
        let store = session.store().clone();
        let path = worker_path(&self.worker_id);
        let resync_interval = Duration::from_millis(self.config.reassign_interval_ms);
        let mut ticker = time::interval(Duration::from_millis(self.config.probe_tick_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let own = store.watch(&path, WatchScope::Key).await.ok();
            self.sync_assignment().await;

            let fired = wait_event(own);
            tokio::pin!(fired);
            let resync = sleep(resync_interval);
            tokio::pin!(resync);

            loop {
                tokio::select! {
                    event = &mut fired => {
                        tracing::debug!(%event, "Worker record changed");
                        break;
                    }
                    _ = &mut resync => break,
                    _ = ticker.tick() => {
                        // In-flight probes are dropped when the round loses the race.
                        let stopped = tokio::select! {
                            _ = self.probe_round() => None,
                            _ = session.lost() => Some(Stop::SessionLost),
                            _ = shutdown.recv() => Some(Stop::Shutdown),
                        };
                        if let Some(stop) = stopped {
                            return self.stop(stop);
                        }
                    }
                    _ = session.lost() => return self.stop(Stop::SessionLost),
                    _ = shutdown.recv() => return self.stop(Stop::Shutdown),
                }
            }
        }
    }

    fn stop(&mut self, reason: Stop) -> Result<(), OrchestratorError> {
        let result = match reason {
            Stop::Shutdown => {
                tracing::info!(worker = %self.worker_id, "Worker received shutdown signal, exiting loop");
                Ok(())
            }
            Stop::SessionLost => {
                tracing::warn!(worker = %self.worker_id, "Worker session lost, dropping assignment");
                self.assignment.clear();
                self.trackers.clear();
                Err(OrchestratorError::SessionLost)
            }
        };
        self.publish_status(false);
        result
    }

    /// Create the ephemeral registration. Returns false on shutdown.
    async fn register(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<bool, OrchestratorError> {
        let store = self.session.store();
        let path = worker_path(&self.worker_id);
        let record = serde_json::to_value(WorkerRecord::new(self.worker_id.clone()))
            .map_err(StoreError::from)?;
        let mut backoff = Backoff::new(100, self.session.ttl().as_millis().max(100) as u64);

        loop {
            match store.create_ephemeral(&path, record.clone(), self.session.id()).await {
                Ok(_) => {
                    tracing::info!(worker = %self.worker_id, "Worker registered");
                    self.publish_status(true);
                    return Ok(true);
                }
                Err(StoreError::SessionExpired) => return Err(OrchestratorError::SessionLost),
                Err(e @ StoreError::NodeExists(_)) | Err(e @ StoreError::Unavailable(_)) => {
                    // NodeExists: a previous incarnation's record, gone after its TTL.
                    let delay = backoff.next_delay();
                    tracing::warn!(worker = %self.worker_id, error = %e, retry_in_ms = delay.as_millis() as u64, "Worker registration failed");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.recv() => return Ok(false),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Re-read our own record; restore it if it vanished while we are live.
    async fn sync_assignment(&mut self) {
        let store = self.session.store().clone();
        let path = worker_path(&self.worker_id);
        match get_json::<WorkerRecord>(store.as_ref(), &path).await {
            Ok(Some((record, _))) => {
                if record.assignment != self.assignment || record.generation != self.generation {
                    tracing::info!(
                        worker = %self.worker_id,
                        generation = record.generation,
                        backends = record.assignment.len(),
                        "Assignment updated"
                    );
                    self.assignment = record.assignment;
                    self.generation = record.generation;
                    metrics::record_assigned_backends(self.assignment.len());
                    self.publish_status(true);
                }
            }
            Ok(None) if self.session.is_live() => {
                tracing::warn!(worker = %self.worker_id, "Worker record missing, re-registering");
                let record = WorkerRecord {
                    worker_id: self.worker_id.clone(),
                    assignment: self.assignment.clone(),
                    generation: self.generation,
                };
                if let Ok(value) = serde_json::to_value(&record) {
                    if let Err(e) = store.create_ephemeral(&path, value, self.session.id()).await {
                        tracing::warn!(worker = %self.worker_id, error = %e, "Failed to re-register worker");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(worker = %self.worker_id, error = %e, "Failed to read assignment, keeping last-known");
            }
        }
    }

    /// One probe round over every due backend.
    pub async fn probe_round(&mut self) {
        let now = Instant::now();
        self.resync_trackers(now).await;

        let table = self.cache.table();
        let mut due = Vec::new();
        for key in &self.assignment {
            let Some(group) = table.group(&key.group) else {
                continue;
            };
            let Some(backend) = group.config().backend(&key.backend_id) else {
                continue;
            };
            let Some(tracker) = self.trackers.get_mut(key) else {
                continue;
            };
            if tracker.record.state == HealthState::Draining || tracker.next_due > now {
                continue;
            }
            let check = group.config().health_check.clone();
            tracker.next_due = now + check.interval();
            due.push((key.clone(), backend.address.clone(), check));
        }

        let probe = self.probe.clone();
        let results: Vec<_> = stream::iter(due)
            .map(|(key, address, check)| {
                let probe = probe.clone();
                async move {
                    let started = Instant::now();
                    let result = match time::timeout(check.timeout(), probe.probe(&address, &check)).await {
                        Ok(result) => result,
                        Err(_) => Err(ProbeError::Timeout(check.timeout())),
                    };
                    (key, check, result, started.elapsed())
                }
            })
            .buffer_unordered(self.config.max_in_flight_probes.max(1))
            .collect()
            .await;

        let now_ms = now_millis();
        for (key, check, result, elapsed) in results {
            let (outcome, label) = match &result {
                Ok(()) => (ProbeOutcome::Success, "success"),
                Err(ProbeError::Timeout(_)) => (ProbeOutcome::Failure, "timeout"),
                Err(ProbeError::Failure(_)) => (ProbeOutcome::Failure, "failure"),
            };
            metrics::record_probe(&key.group, label, elapsed);
            if let Err(e) = &result {
                tracing::debug!(backend = %key, error = %e, "Probe failed");
            }

            let Some(tracker) = self.trackers.get_mut(&key) else {
                continue;
            };
            if let Some(t) = tracker.record.observe(outcome, &check, now_ms) {
                tracing::info!(backend = %key, from = %t.from, to = %t.to, "Health transition");
                metrics::record_health_transition(&key.group, &t.from.to_string(), &t.to.to_string());
                tracker.dirty = true;
            }
        }

        self.flush(&table).await;
        self.status_tx.send_modify(|s| s.last_round_ms = now_ms);
    }

    /// Align trackers with the assignment and the stored records.
    async fn resync_trackers(&mut self, now: Instant) {
        let assignment = &self.assignment;
        self.trackers.retain(|key, _| assignment.contains(key));
        for key in assignment {
            self.trackers
                .entry(key.clone())
                .or_insert_with(|| Tracker::new(key, now));
        }

        let stored = match load_health(self.session.store().as_ref()).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to re-sync health records");
                return;
            }
        };

        for (key, tracker) in self.trackers.iter_mut() {
            match stored.get(key) {
                Some((record, version)) if tracker.version != Some(*version) => {
                    let adopt = tracker.fresh || !tracker.dirty || record.state == HealthState::Draining;
                    if adopt {
                        if record.state != tracker.record.state && !tracker.fresh {
                            tracing::info!(backend = %key, state = %record.state, "Adopting externally set health state");
                        }
                        tracker.record = record.clone();
                        tracker.version = Some(*version);
                        tracker.dirty = false;
                    }
                }
                Some(_) => {}
                None => {
                    // First assignment, or removed behind our back: (re)create.
                    if tracker.version.is_some() || tracker.fresh {
                        tracker.version = None;
                        tracker.dirty = true;
                    }
                }
            }
            tracker.fresh = false;
        }
    }

    async fn flush(&mut self, table: &RoutingTable) {
        let store = self.session.store().clone();
        for (key, tracker) in self.trackers.iter_mut().filter(|(_, t)| t.dirty) {
            let configured = table
                .group(&key.group)
                .map(|g| g.config().backend(&key.backend_id).is_some())
                .unwrap_or(false);
            if !configured {
                continue;
            }
            if let Err(e) = persist(store.as_ref(), key, tracker, self.cas_max_attempts).await {
                metrics::record_store_error("health_write");
                tracing::warn!(backend = %key, error = %e, "Failed to persist health, will retry");
            }
        }
    }

    fn publish_status(&self, registered: bool) {
        self.status_tx.send_modify(|s| {
            s.registered = registered;
            s.generation = self.generation;
            s.assigned = self.assignment.len();
        });
    }
}

/// CAS the tracker's record. On conflict re-read; DRAINING in the store wins.
async fn persist(
    store: &dyn CoordinationStore,
    key: &BackendKey,
    tracker: &mut Tracker,
    max_attempts: u32,
) -> Result<(), StoreError> {
    let path = backend_health_path(&key.group, &key.backend_id);
    for _ in 0..max_attempts {
        let expected = match tracker.version {
            Some(version) => ExpectedVersion::Exactly(version),
            None => ExpectedVersion::Absent,
        };
        match store.set(&path, serde_json::to_value(&tracker.record)?, expected).await {
            Ok(version) => {
                tracker.version = Some(version);
                tracker.dirty = false;
                return Ok(());
            }
            Err(StoreError::VersionConflict { .. })
            | Err(StoreError::NodeExists(_))
            | Err(StoreError::NotFound(_)) => {
                match get_json::<BackendHealthRecord>(store, &path).await? {
                    Some((stored, version)) if stored.state == HealthState::Draining => {
                        tracing::info!(backend = %key, "Backend is draining, discarding probe verdict");
                        tracker.record = stored;
                        tracker.version = Some(version);
                        tracker.dirty = false;
                        return Ok(());
                    }
                    Some((_, version)) => tracker.version = Some(version),
                    None => tracker.version = None,
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::VersionConflict { path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::group::{BackendRef, HealthCheckSpec, LbGroupConfig, SelectionAlgorithm};
    use crate::config::schema::StoreConfig;
    use crate::store::paths::group_config_path;
    use crate::store::{MemoryStore, StoreHandle};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Answers from a mutable set of failing addresses.
    #[derive(Default)]
    struct ScriptedProbe {
        failing: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, address: &str, _check: &HealthCheckSpec) -> Result<(), ProbeError> {
            if self.failing.lock().contains(address) {
                Err(ProbeError::Failure("scripted".into()))
            } else {
                Ok(())
            }
        }
    }

    /// Never answers within the probe timeout.
    struct HangingProbe;

    #[async_trait]
    impl HealthProbe for HangingProbe {
        async fn probe(&self, _address: &str, _check: &HealthCheckSpec) -> Result<(), ProbeError> {
            sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    struct Fixture {
        store: MemoryStore,
        worker: Worker,
        probe: Arc<ScriptedProbe>,
    }

    async fn fixture() -> Fixture {
        let probe = Arc::new(ScriptedProbe::default());
        let (store, worker) = fixture_with(probe.clone()).await;
        Fixture { store, worker, probe }
    }

    async fn fixture_with(probe: Arc<dyn HealthProbe>) -> (MemoryStore, Worker) {
        let store = MemoryStore::new();
        let handle: StoreHandle = Arc::new(store.clone());
        let group = LbGroupConfig {
            name: "api".into(),
            backends: vec![
                BackendRef { id: "b1".into(), address: "10.0.0.1:80".into(), weight: 1 },
                BackendRef { id: "b2".into(), address: "10.0.0.2:80".into(), weight: 1 },
            ],
            health_check: HealthCheckSpec {
                interval_ms: 1,
                failure_threshold: 2,
                success_threshold: 1,
                ..HealthCheckSpec::default()
            },
            algorithm: SelectionAlgorithm::RoundRobin,
            version: 1,
        };
        store
            .set(&group_config_path("api"), serde_json::to_value(&group).unwrap(), ExpectedVersion::Any)
            .await
            .unwrap();

        let cache = Arc::new(ConfigCache::new(handle.clone(), Duration::from_secs(30), &StoreConfig::default()));
        cache.refresh().await.unwrap();

        let session = Arc::new(Session::open(handle, Duration::from_secs(5)).await.unwrap());
        let mut worker = Worker::new("w1", session, cache, probe, OrchestratorConfig::default(), 5);
        worker.assignment = [BackendKey::new("api", "b1"), BackendKey::new("api", "b2")]
            .into_iter()
            .collect();

        (store, worker)
    }

    async fn stored_state(store: &MemoryStore, id: &str) -> Option<HealthState> {
        get_json::<BackendHealthRecord>(store, &backend_health_path("api", id))
            .await
            .unwrap()
            .map(|(r, _)| r.state)
    }

    async fn round(worker: &mut Worker) {
        sleep(Duration::from_millis(5)).await;
        worker.probe_round().await;
    }

    #[tokio::test]
    async fn test_records_created_and_transitions_written() {
        let mut f = fixture().await;
        f.probe.failing.lock().insert("10.0.0.2:80".into());

        round(&mut f.worker).await;
        assert_eq!(stored_state(&f.store, "b1").await, Some(HealthState::Healthy));
        assert_eq!(stored_state(&f.store, "b2").await, Some(HealthState::Unknown));

        round(&mut f.worker).await;
        assert_eq!(stored_state(&f.store, "b2").await, Some(HealthState::Unhealthy));
    }

    #[tokio::test]
    async fn test_only_transitions_are_written() {
        let mut f = fixture().await;
        round(&mut f.worker).await;
        let (_, v1) = get_json::<BackendHealthRecord>(&f.store, &backend_health_path("api", "b1"))
            .await
            .unwrap()
            .unwrap();
        for _ in 0..3 {
            round(&mut f.worker).await;
        }
        let (_, v2) = get_json::<BackendHealthRecord>(&f.store, &backend_health_path("api", "b1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v1, v2);
    }

    #[tokio::test]
    async fn test_never_overwrites_draining() {
        let mut f = fixture().await;
        round(&mut f.worker).await;

        let mut drained = BackendHealthRecord::new("api", "b1");
        drained.state = HealthState::Draining;
        f.store
            .set(
                &backend_health_path("api", "b1"),
                serde_json::to_value(&drained).unwrap(),
                ExpectedVersion::Any,
            )
            .await
            .unwrap();

        f.probe.failing.lock().insert("10.0.0.1:80".into());
        for _ in 0..4 {
            round(&mut f.worker).await;
        }
        assert_eq!(stored_state(&f.store, "b1").await, Some(HealthState::Draining));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_slow_round() {
        let (store, mut worker) = fixture_with(Arc::new(HangingProbe)).await;
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(async move { worker.run(rx).await });

        sleep(Duration::from_millis(50)).await;
        let record = WorkerRecord {
            worker_id: "w1".into(),
            assignment: [BackendKey::new("api", "b1"), BackendKey::new("api", "b2")]
                .into_iter()
                .collect(),
            generation: 1,
        };
        store
            .set(&worker_path("w1"), serde_json::to_value(&record).unwrap(), ExpectedVersion::Any)
            .await
            .unwrap();

        // The next tick starts a round that only ends at the 2s probe timeout.
        sleep(Duration::from_millis(400)).await;
        tx.send(()).unwrap();

        let result = time::timeout(Duration::from_millis(500), task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))), "worker did not stop promptly");
    }
}
