//! Routing decisions driven by stored config and health.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lb_control_plane::cache::ConfigCache;
use lb_control_plane::config::group::SelectionAlgorithm;
use lb_control_plane::health::HealthState;
use lb_control_plane::load_balancer::{Outcome, RoutingEngine, RoutingError};

mod common;

async fn engine_for(handle: lb_control_plane::StoreHandle) -> RoutingEngine {
    let cache = Arc::new(ConfigCache::new(handle, Duration::from_secs(30), &common::fast_store_config()));
    cache.refresh().await.unwrap();
    RoutingEngine::new(cache)
}

#[tokio::test]
async fn test_weighted_distribution_follows_weights() {
    let (store, handle) = common::memory_store();
    common::put_group(
        &store,
        &common::group(
            "api",
            &[("a", "10.0.0.1:80", 5), ("b", "10.0.0.2:80", 3), ("c", "10.0.0.3:80", 2)],
            SelectionAlgorithm::WeightedRoundRobin,
        ),
    )
    .await;
    for id in ["a", "b", "c"] {
        common::put_health(&store, "api", id, HealthState::Healthy).await;
    }
    let engine = engine_for(handle).await;

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..100 {
        let lease = engine.select_backend("api").unwrap();
        *counts.entry(lease.backend_id().to_string()).or_default() += 1;
        lease.complete(Outcome::Success, Duration::from_millis(1));
    }
    assert_eq!(counts["a"], 50);
    assert_eq!(counts["b"], 30);
    assert_eq!(counts["c"], 20);
}

#[tokio::test]
async fn test_only_healthy_backends_are_selected() {
    let (store, handle) = common::memory_store();
    common::put_group(
        &store,
        &common::group(
            "api",
            &[("a", "10.0.0.1:80", 1), ("b", "10.0.0.2:80", 1), ("c", "10.0.0.3:80", 1), ("d", "10.0.0.4:80", 1)],
            SelectionAlgorithm::RoundRobin,
        ),
    )
    .await;
    common::put_health(&store, "api", "a", HealthState::Healthy).await;
    common::put_health(&store, "api", "b", HealthState::Unhealthy).await;
    common::put_health(&store, "api", "c", HealthState::Draining).await;
    // d has no record: UNKNOWN
    let engine = engine_for(handle).await;

    for _ in 0..10 {
        assert_eq!(engine.select_backend("api").unwrap().backend_id(), "a");
    }
}

#[tokio::test]
async fn test_empty_pool_and_missing_group() {
    let (store, handle) = common::memory_store();
    common::put_group(
        &store,
        &common::group("api", &[("a", "10.0.0.1:80", 1)], SelectionAlgorithm::LeastConnections),
    )
    .await;
    common::put_health(&store, "api", "a", HealthState::Unhealthy).await;
    let engine = engine_for(handle).await;

    assert!(matches!(engine.select_backend("api"), Err(RoutingError::BackendPoolEmpty(_))));
    assert!(matches!(engine.select_backend("web"), Err(RoutingError::ConfigNotFound(_))));
}

#[tokio::test]
async fn test_least_connections_prefers_idle_backend() {
    let (store, handle) = common::memory_store();
    common::put_group(
        &store,
        &common::group(
            "api",
            &[("a", "10.0.0.1:80", 1), ("b", "10.0.0.2:80", 1)],
            SelectionAlgorithm::LeastConnections,
        ),
    )
    .await;
    common::put_health(&store, "api", "a", HealthState::Healthy).await;
    common::put_health(&store, "api", "b", HealthState::Healthy).await;
    let engine = engine_for(handle).await;

    let first = engine.select_backend("api").unwrap();
    let second = engine.select_backend("api").unwrap();
    assert_ne!(first.backend_id(), second.backend_id());

    let held = first.backend_id().to_string();
    second.complete(Outcome::Success, Duration::from_millis(2));
    for _ in 0..5 {
        let lease = engine.select_backend("api").unwrap();
        assert_ne!(lease.backend_id(), held);
        lease.complete(Outcome::Success, Duration::from_millis(1));
    }
    drop(first);
}
