//! Active health probes.
//!
//! # Responsibilities
//! - Issue one bounded-time check against a backend
//! - Classify the answer as success, failure or timeout
//!
//! # Design Decisions
//! - The timeout is enforced here, so a hung backend never blocks a worker
//! - Only the group's expected status counts as success

use async_trait::async_trait;
use axum::body::Body;
use hyper::Request;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::time::Duration;
use thiserror::Error;
use tokio::time;

use crate::config::group::HealthCheckSpec;

/// A probe that did not succeed. Transient, counted toward the failure threshold.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe failed: {0}")]
    Failure(String),
}

/// Something that can check a backend.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn probe(&self, address: &str, check: &HealthCheckSpec) -> Result<(), ProbeError>;
}

/// `GET http://<address><path>` expecting the configured status.
#[derive(Clone)]
pub struct HttpProbe {
    client: Client<HttpConnector, Body>,
}

impl HttpProbe {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(connector);
        Self { client }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, address: &str, check: &HealthCheckSpec) -> Result<(), ProbeError> {
        let uri = format!("http://{}{}", address, check.path);
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header("user-agent", "lb-control-plane-health-check")
            .body(Body::empty())
            .map_err(|e| ProbeError::Failure(format!("invalid request: {}", e)))?;

        let timeout = check.timeout();
        match time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                if status == check.expected_status {
                    Ok(())
                } else {
                    Err(ProbeError::Failure(format!(
                        "status {} (expected {})",
                        status, check.expected_status
                    )))
                }
            }
            Ok(Err(e)) => Err(ProbeError::Failure(format!("connection error: {}", e))),
            Err(_) => Err(ProbeError::Timeout(timeout)),
        }
    }
}
