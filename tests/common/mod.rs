//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use lb_control_plane::config::group::{BackendRef, HealthCheckSpec, LbGroupConfig, SelectionAlgorithm};
use lb_control_plane::config::schema::{OrchestratorConfig, StoreConfig};
use lb_control_plane::health::{BackendHealthRecord, HealthState};
use lb_control_plane::store::paths::{backend_health_path, group_config_path};
use lb_control_plane::store::{CoordinationStore, ExpectedVersion, MemoryStore, StoreHandle};

/// Start a programmable mock backend on an ephemeral port.
///
/// `f` returns the status code and body of every response.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        let _ = socket.read(&mut buf).await;
                        let (status, body) = f().await;
                        let status_text = match status {
                            200 => "200 OK",
                            204 => "204 No Content",
                            404 => "404 Not Found",
                            500 => "500 Internal Server Error",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };
                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Mock backend that always answers `status`.
pub async fn start_mock_backend(status: u16) -> SocketAddr {
    start_programmable_backend(move || async move { (status, "ok".to_string()) }).await
}

/// A memory store and a shared handle to it.
pub fn memory_store() -> (MemoryStore, StoreHandle) {
    let store = MemoryStore::new();
    store.start_reaper(Duration::from_millis(20));
    let handle: StoreHandle = Arc::new(store.clone());
    (store, handle)
}

/// Store settings with short retries for tests.
pub fn fast_store_config() -> StoreConfig {
    StoreConfig {
        session_ttl_ms: 300,
        reap_interval_ms: 20,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 100,
        ..StoreConfig::default()
    }
}

/// Orchestrator settings with short intervals for tests.
pub fn fast_orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        probe_tick_ms: 10,
        reassign_interval_ms: 100,
        ..OrchestratorConfig::default()
    }
}

/// Group with `(id, address, weight)` backends and fast health checks.
pub fn group(name: &str, backends: &[(&str, &str, u32)], algorithm: SelectionAlgorithm) -> LbGroupConfig {
    LbGroupConfig {
        name: name.to_string(),
        backends: backends
            .iter()
            .map(|(id, address, weight)| BackendRef {
                id: id.to_string(),
                address: address.to_string(),
                weight: *weight,
            })
            .collect(),
        health_check: HealthCheckSpec {
            interval_ms: 10,
            timeout_ms: 200,
            failure_threshold: 2,
            success_threshold: 1,
            ..HealthCheckSpec::default()
        },
        algorithm,
        version: 1,
    }
}

pub async fn put_group(store: &dyn CoordinationStore, group: &LbGroupConfig) {
    store
        .set(
            &group_config_path(&group.name),
            serde_json::to_value(group).unwrap(),
            ExpectedVersion::Any,
        )
        .await
        .unwrap();
}

pub async fn put_health(store: &dyn CoordinationStore, group: &str, backend_id: &str, state: HealthState) {
    let mut record = BackendHealthRecord::new(group, backend_id);
    record.state = state;
    store
        .set(
            &backend_health_path(group, backend_id),
            serde_json::to_value(&record).unwrap(),
            ExpectedVersion::Any,
        )
        .await
        .unwrap();
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
