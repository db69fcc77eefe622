//! HTTP health probe against mock backends.

use std::time::Duration;

use lb_control_plane::config::group::HealthCheckSpec;
use lb_control_plane::health::{HealthProbe, HttpProbe, ProbeError};

mod common;

fn check(timeout_ms: u64) -> HealthCheckSpec {
    HealthCheckSpec {
        timeout_ms,
        ..HealthCheckSpec::default()
    }
}

#[tokio::test]
async fn test_expected_status_is_healthy() {
    let addr = common::start_mock_backend(200).await;
    let probe = HttpProbe::new();
    assert!(probe.probe(&addr.to_string(), &check(1_000)).await.is_ok());
}

#[tokio::test]
async fn test_unexpected_status_fails() {
    let addr = common::start_mock_backend(503).await;
    let probe = HttpProbe::new();
    let err = probe.probe(&addr.to_string(), &check(1_000)).await.unwrap_err();
    assert!(matches!(err, ProbeError::Failure(msg) if msg.contains("503")));
}

#[tokio::test]
async fn test_custom_expected_status() {
    let addr = common::start_mock_backend(204).await;
    let probe = HttpProbe::new();
    let spec = HealthCheckSpec {
        expected_status: 204,
        ..check(1_000)
    };
    assert!(probe.probe(&addr.to_string(), &spec).await.is_ok());
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let addr = common::start_programmable_backend(|| async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        (200, "late".to_string())
    })
    .await;
    let probe = HttpProbe::new();
    let err = probe.probe(&addr.to_string(), &check(100)).await.unwrap_err();
    assert!(matches!(err, ProbeError::Timeout(_)));
}

#[tokio::test]
async fn test_refused_connection_fails() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let probe = HttpProbe::new();
    assert!(probe.probe(&addr.to_string(), &check(500)).await.is_err());
}
