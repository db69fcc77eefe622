//! Group config propagation into the routing cache.

use std::sync::Arc;
use std::time::Duration;

use lb_control_plane::cache::ConfigCache;
use lb_control_plane::config::group::SelectionAlgorithm;
use lb_control_plane::health::HealthState;
use lb_control_plane::lifecycle::Shutdown;
use lb_control_plane::orchestrator::Supervisor;
use lb_control_plane::store::paths::{backend_health_path, group_config_path};
use lb_control_plane::store::{CoordinationStore, ExpectedVersion};
use lb_control_plane::RoutingEngine;

mod common;

fn api(version: u64, backends: &[(&str, &str, u32)]) -> lb_control_plane::config::LbGroupConfig {
    let mut g = common::group("api", backends, SelectionAlgorithm::RoundRobin);
    g.version = version;
    g
}

fn version_of(cache: &ConfigCache) -> Option<u64> {
    cache.group("api").map(|g| g.version())
}

#[tokio::test]
async fn test_watch_driven_and_reconcile_driven_updates() {
    let (store, handle) = common::memory_store();
    let cache = Arc::new(ConfigCache::new(
        handle.clone(),
        Duration::from_millis(200),
        &common::fast_store_config(),
    ));
    let shutdown = Shutdown::new();
    let task = cache.clone();
    let rx = shutdown.subscribe();
    tokio::spawn(async move { task.run(rx).await });

    common::put_group(&store, &api(1, &[("b1", "10.0.0.1:80", 1)])).await;
    assert!(common::wait_until(Duration::from_secs(1), || async { version_of(&cache) == Some(1) }).await);

    common::put_group(&store, &api(2, &[("b1", "10.0.0.1:80", 1), ("b2", "10.0.0.2:80", 1)])).await;
    assert!(common::wait_until(Duration::from_secs(1), || async { version_of(&cache) == Some(2) }).await);
    assert_eq!(cache.group("api").unwrap().backends().len(), 2);

    // Lost notifications: the reconcile poll still converges.
    store.set_notifications_enabled(false);
    common::put_group(&store, &api(3, &[("b2", "10.0.0.2:80", 1)])).await;
    assert!(common::wait_until(Duration::from_secs(2), || async { version_of(&cache) == Some(3) }).await);

    common::put_health(&store, "api", "b2", HealthState::Healthy).await;
    assert!(
        common::wait_until(Duration::from_secs(2), || async {
            cache
                .group("api")
                .and_then(|g| g.backend("b2").map(|b| b.health() == HealthState::Healthy))
                .unwrap_or(false)
        })
        .await
    );

    shutdown.trigger();
}

#[tokio::test]
async fn test_versions_never_regress_and_invalid_configs_are_rejected() {
    let (store, handle) = common::memory_store();
    let cache = ConfigCache::new(handle, Duration::from_secs(30), &common::fast_store_config());

    common::put_group(&store, &api(3, &[("b1", "10.0.0.1:80", 1)])).await;
    cache.refresh().await.unwrap();
    assert_eq!(version_of(&cache), Some(3));

    common::put_group(&store, &api(2, &[("b9", "10.0.0.9:80", 1)])).await;
    let summary = cache.refresh().await.unwrap();
    assert!(summary.rebuilt.is_empty());
    assert_eq!(version_of(&cache), Some(3));
    assert!(cache.group("api").unwrap().backend("b1").is_some());

    common::put_group(&store, &api(4, &[])).await;
    let summary = cache.refresh().await.unwrap();
    assert_eq!(summary.rejected, vec!["api".to_string()]);
    assert_eq!(version_of(&cache), Some(3));
    assert_eq!(cache.rejections().len(), 1);

    common::put_group(&store, &api(5, &[("b1", "10.0.0.1:80", 2)])).await;
    cache.refresh().await.unwrap();
    assert_eq!(version_of(&cache), Some(5));
    assert!(cache.rejections().is_empty());
}

#[tokio::test]
async fn test_store_outage_serves_last_known_good() {
    let (store, handle) = common::memory_store();
    let cache = ConfigCache::new(handle, Duration::from_secs(30), &common::fast_store_config());

    common::put_group(&store, &api(1, &[("b1", "10.0.0.1:80", 1)])).await;
    cache.refresh().await.unwrap();

    store.set_available(false);
    assert!(cache.refresh().await.is_err());
    assert_eq!(version_of(&cache), Some(1));
    store.set_available(true);
}

#[tokio::test]
async fn test_rejected_update_keeps_group_routable() {
    let (store, handle) = common::memory_store();
    common::put_group(&store, &api(1, &[("b1", "10.0.0.1:8080", 1)])).await;
    common::put_health(&store, "api", "b1", HealthState::Healthy).await;

    let cache = Arc::new(ConfigCache::new(
        handle.clone(),
        Duration::from_secs(30),
        &common::fast_store_config(),
    ));
    cache.refresh().await.unwrap();
    let engine = RoutingEngine::new(cache.clone());
    assert_eq!(engine.select_backend("api").unwrap().address(), "10.0.0.1:8080");

    let supervisor = Supervisor::new(handle.clone(), common::fast_orchestrator_config(), 5);
    supervisor.reconcile().await.unwrap();

    let malformed = serde_json::json!({
        "name": "api",
        "backends": [{ "id": "b1", "address": "10.0.0.1:8080", "weight": 0 }],
        "version": 2
    });
    store
        .set(&group_config_path("api"), malformed, ExpectedVersion::Any)
        .await
        .unwrap();

    let report = supervisor.reconcile().await.unwrap();
    assert_eq!(report.removed_health, 0);
    assert_eq!(report.backends, 1);
    assert_eq!(report.rejected, vec!["api".to_string()]);
    assert!(store.get(&backend_health_path("api", "b1")).await.unwrap().is_some());

    cache.refresh().await.unwrap();
    assert_eq!(version_of(&cache), Some(1));
    assert_eq!(engine.select_backend("api").unwrap().address(), "10.0.0.1:8080");
}
