//! Load-balancer node registry.
//!
//! Every LB node keeps an ephemeral `LbNodeRecord` at `/lb-nodes/<id>` for
//! as long as its session lives. Discovery reads these to answer clients.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::discovery::DiscoveryError;
use crate::resilience::Backoff;
use crate::store::paths::lb_node_path;
use crate::store::{wait_event, ExpectedVersion, Session, StoreError, WatchScope};

/// Payload of `/lb-nodes/<nodeId>`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LbNodeRecord {
    pub node_id: String,
    /// Client-facing `host:port`.
    pub address: String,
    #[serde(default)]
    pub locality: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Keeps this node's record registered.
#[derive(Debug)]
pub struct NodeRegistration {
    session: Arc<Session>,
    record: LbNodeRecord,
    recheck_interval: Duration,
}

impl NodeRegistration {
    pub fn new(session: Arc<Session>, record: LbNodeRecord, recheck_interval: Duration) -> Self {
        Self {
            session,
            record,
            recheck_interval,
        }
    }

    pub fn record(&self) -> &LbNodeRecord {
        &self.record
    }

    /// Create the record. `NodeExists` is a leftover of a previous
    /// incarnation and is replaced once it expires.
    async fn ensure_registered(&self) -> Result<bool, StoreError> {
        let path = lb_node_path(&self.record.node_id);
        let value = serde_json::to_value(&self.record)?;
        match self.session.store().create_ephemeral(&path, value, self.session.id()).await {
            Ok(_) => {
                tracing::info!(
                    node_id = %self.record.node_id,
                    address = %self.record.address,
                    "Load balancer node registered"
                );
                Ok(true)
            }
            Err(StoreError::NodeExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Re-register on deletion until shutdown; deregister on the way out.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), DiscoveryError> {
        let store = self.session.store().clone();
        let path = lb_node_path(&self.record.node_id);
        let mut backoff = Backoff::new(100, self.recheck_interval.as_millis().max(100) as u64);

        loop {
            let watch = store.watch(&path, WatchScope::Key).await.ok();
            let delay = match self.ensure_registered().await {
                Ok(_) => {
                    backoff.reset();
                    self.recheck_interval
                }
                Err(StoreError::SessionExpired) => {
                    return Err(StoreError::SessionExpired.into());
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Node registration failed");
                    delay
                }
            };

            tokio::select! {
                event = wait_event(watch) => {
                    tracing::debug!(%event, "Node record changed");
                }
                _ = sleep(delay) => {}
                _ = self.session.lost() => return Err(StoreError::SessionExpired.into()),
                _ = shutdown.recv() => {
                    self.deregister().await;
                    return Ok(());
                }
            }
        }
    }

    /// Remove the record now instead of waiting for the session TTL.
    pub async fn deregister(&self) {
        let path = lb_node_path(&self.record.node_id);
        match self.session.store().delete(&path, ExpectedVersion::Any).await {
            Ok(()) => tracing::info!(node_id = %self.record.node_id, "Load balancer node deregistered"),
            Err(e) => tracing::warn!(node_id = %self.record.node_id, error = %e, "Failed to deregister node"),
        }
    }
}
