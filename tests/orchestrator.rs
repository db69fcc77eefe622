//! Health orchestrator: partitioning, probing and worker failover.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use lb_control_plane::cache::ConfigCache;
use lb_control_plane::config::group::{HealthCheckSpec, SelectionAlgorithm};
use lb_control_plane::health::{load_health, HealthProbe, HealthState, ProbeError};
use lb_control_plane::lifecycle::Shutdown;
use lb_control_plane::orchestrator::{BackendKey, Supervisor, Worker, WorkerRecord};
use lb_control_plane::store::paths::WORKERS_PATH;
use lb_control_plane::store::{CoordinationStore, MemoryStore, Session, StoreHandle};

mod common;

const BACKENDS: usize = 50;

/// Fails every address in `failing`.
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

fn address(i: usize) -> String {
    format!("10.0.{}.{}:80", i / 200, i % 200 + 1)
}

async fn worker_records(store: &MemoryStore) -> Vec<WorkerRecord> {
    store
        .list(WORKERS_PATH)
        .await
        .unwrap()
        .into_iter()
        .map(|(_, v)| v.decode::<WorkerRecord>().unwrap())
        .collect()
}

async fn states(store: &MemoryStore) -> Vec<HealthState> {
    load_health(store).await.unwrap().into_values().map(|(r, _)| r.state).collect()
}

async fn spawn_worker(
    id: &str,
    handle: &StoreHandle,
    cache: &Arc<ConfigCache>,
    probe: &Arc<ScriptedProbe>,
    shutdown: &Shutdown,
) -> Arc<Session> {
    let session = Arc::new(Session::open(handle.clone(), Duration::from_millis(300)).await.unwrap());
    let probe: Arc<dyn HealthProbe> = probe.clone();
    let mut worker = Worker::new(
        id,
        session.clone(),
        cache.clone(),
        probe,
        common::fast_orchestrator_config(),
        5,
    );
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = worker.run(rx).await;
    });
    session
}

#[tokio::test]
async fn test_fifty_backends_partitioned_and_reassigned_on_worker_death() {
    let (store, handle) = common::memory_store();
    let backends: Vec<(String, String)> = (0..BACKENDS).map(|i| (format!("b{}", i), address(i))).collect();
    let refs: Vec<(&str, &str, u32)> = backends.iter().map(|(id, a)| (id.as_str(), a.as_str(), 1)).collect();
    common::put_group(&store, &common::group("fleet", &refs, SelectionAlgorithm::RoundRobin)).await;

    let cache = Arc::new(ConfigCache::new(handle.clone(), Duration::from_secs(30), &common::fast_store_config()));
    cache.refresh().await.unwrap();

    let shutdown = Shutdown::new();
    let probe = Arc::new(ScriptedProbe::default());
    let _w1 = spawn_worker("w1", &handle, &cache, &probe, &shutdown).await;
    let w2 = spawn_worker("w2", &handle, &cache, &probe, &shutdown).await;
    let _w3 = spawn_worker("w3", &handle, &cache, &probe, &shutdown).await;

    assert!(
        common::wait_until(Duration::from_secs(2), || async { worker_records(&store).await.len() == 3 }).await,
        "workers did not register"
    );

    let supervisor = Supervisor::new(handle.clone(), common::fast_orchestrator_config(), 5);
    let report = supervisor.reconcile().await.unwrap();
    assert_eq!(report.workers, 3);
    assert_eq!(report.backends, BACKENDS);

    // Every backend is owned by exactly one worker.
    let records = worker_records(&store).await;
    let total: usize = records.iter().map(|r| r.assignment.len()).sum();
    let union: BTreeSet<&BackendKey> = records.iter().flat_map(|r| r.assignment.iter()).collect();
    assert_eq!(total, BACKENDS);
    assert_eq!(union.len(), BACKENDS);

    assert!(
        common::wait_until(Duration::from_secs(3), || async {
            let s = states(&store).await;
            s.len() == BACKENDS && s.iter().all(|s| *s == HealthState::Healthy)
        })
        .await,
        "backends did not all become healthy"
    );

    // Crash w2 and reassign.
    let orphaned: Vec<BackendKey> = records
        .iter()
        .find(|r| r.worker_id == "w2")
        .map(|r| r.assignment.iter().cloned().collect())
        .unwrap_or_default();
    assert!(!orphaned.is_empty());
    store.expire_session(w2.id());
    assert!(common::wait_until(Duration::from_secs(2), || async { worker_records(&store).await.len() == 2 }).await);

    let report = supervisor.reconcile().await.unwrap();
    assert_eq!(report.workers, 2);
    let records = worker_records(&store).await;
    let union: BTreeSet<&BackendKey> = records.iter().flat_map(|r| r.assignment.iter()).collect();
    assert_eq!(union.len(), BACKENDS);

    // An orphaned backend going down is noticed by its new owner.
    let victim = &orphaned[0];
    let victim_address = backends
        .iter()
        .find(|(id, _)| *id == victim.backend_id)
        .map(|(_, a)| a.clone())
        .unwrap();
    probe.failing.lock().insert(victim_address);

    assert!(
        common::wait_until(Duration::from_secs(3), || async {
            load_health(&store)
                .await
                .unwrap()
                .get(victim)
                .map(|(r, _)| r.state == HealthState::Unhealthy)
                .unwrap_or(false)
        })
        .await,
        "reassigned backend was not probed"
    );

    shutdown.trigger();
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let (store, handle) = common::memory_store();
    common::put_group(
        &store,
        &common::group("api", &[("a", "10.0.0.1:80", 1), ("b", "10.0.0.2:80", 1)], SelectionAlgorithm::RoundRobin),
    )
    .await;
    let cache = Arc::new(ConfigCache::new(handle.clone(), Duration::from_secs(30), &common::fast_store_config()));
    cache.refresh().await.unwrap();

    let shutdown = Shutdown::new();
    let probe = Arc::new(ScriptedProbe::default());
    let _w1 = spawn_worker("w1", &handle, &cache, &probe, &shutdown).await;
    assert!(common::wait_until(Duration::from_secs(2), || async { worker_records(&store).await.len() == 1 }).await);

    let supervisor = Supervisor::new(handle.clone(), common::fast_orchestrator_config(), 5);
    let first = supervisor.reconcile().await.unwrap();
    assert_eq!(first.rewritten, vec!["w1".to_string()]);
    let second = supervisor.reconcile().await.unwrap();
    assert!(second.rewritten.is_empty());

    shutdown.trigger();
}
