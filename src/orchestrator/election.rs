//! Leader election over an ephemeral record.
//!
//! # Responsibilities
//! - Claim `/orchestrator/leader` with an atomic create-if-absent
//! - Follow the current leader and re-run on its disappearance
//! - Publish the local view of leadership on a `watch` channel
//!
//! # Design Decisions
//! - At most one leader is guaranteed by the store, not by this module
//! - The watch is armed before the leader record is re-read, so a leader
//!   that vanishes in between is never missed
//! - Losing the session means losing leadership; the caller re-elects
//!   with a fresh session

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;

use crate::observability::metrics;
use crate::orchestrator::OrchestratorError;
use crate::resilience::Backoff;
use crate::store::paths::LEADER_PATH;
use crate::store::{wait_event, CoordinationStore, ExpectedVersion, Session, StoreError, WatchScope};

/// Local view of the election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "role", content = "leader", rename_all = "snake_case")]
pub enum LeadershipState {
    NoLeader,
    Leading,
    Following(String),
}

impl LeadershipState {
    pub fn is_leading(&self) -> bool {
        matches!(self, LeadershipState::Leading)
    }
}

/// Read the current leader id, if any.
pub async fn current_leader(store: &dyn CoordinationStore) -> Result<Option<String>, StoreError> {
    Ok(store
        .get(LEADER_PATH)
        .await?
        .and_then(|v| v.value.as_str().map(str::to_string)))
}

/// One node's participation in the election.
#[derive(Debug)]
pub struct LeaderElection {
    node_id: String,
    session: Arc<Session>,
    recheck_interval: Duration,
    state_tx: watch::Sender<LeadershipState>,
}

impl LeaderElection {
    /// `recheck_interval` bounds how long a follower relies on a watch alone.
    pub fn new(node_id: impl Into<String>, session: Arc<Session>, recheck_interval: Duration) -> Self {
        let (state_tx, _) = watch::channel(LeadershipState::NoLeader);
        Self {
            node_id: node_id.into(),
            session,
            recheck_interval,
            state_tx,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn state(&self) -> LeadershipState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: LeadershipState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if changed {
            metrics::record_leadership(state.is_leading());
            match &state {
                LeadershipState::Leading => {
                    tracing::info!(node_id = %self.node_id, "Elected orchestrator leader")
                }
                LeadershipState::Following(leader) => {
                    tracing::info!(node_id = %self.node_id, leader = %leader, "Following orchestrator leader")
                }
                LeadershipState::NoLeader => {
                    tracing::info!(node_id = %self.node_id, "No orchestrator leader")
                }
            }
        }
    }

    /// Run until shutdown (`Ok`) or session loss (`LeaderLost`).
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), OrchestratorError> {
        let store = self.session.store().clone();
        let mut backoff = Backoff::new(100, self.recheck_interval.as_millis().max(100) as u64);

        loop {
            if !self.session.is_live() {
                self.set_state(LeadershipState::NoLeader);
                return Err(OrchestratorError::LeaderLost);
            }

            let result = store
                .create_ephemeral(LEADER_PATH, Value::String(self.node_id.clone()), self.session.id())
                .await;

            let outcome = match result {
                Ok(version) => {
                    backoff.reset();
                    self.set_state(LeadershipState::Leading);
                    self.hold(store.as_ref(), version, &mut shutdown).await
                }
                Err(StoreError::NodeExists(_)) => {
                    backoff.reset();
                    self.follow(store.as_ref(), &mut shutdown).await
                }
                Err(StoreError::SessionExpired) => Err(OrchestratorError::LeaderLost),
                Err(e) if e.is_retryable() => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Election attempt failed");
                    tokio::select! {
                        _ = sleep(delay) => Ok(Step::Retry),
                        _ = shutdown.recv() => Ok(Step::Shutdown),
                    }
                }
                Err(e) => Err(e.into()),
            };

            match outcome {
                Ok(Step::Retry) => continue,
                Ok(Step::Shutdown) => {
                    self.set_state(LeadershipState::NoLeader);
                    return Ok(());
                }
                Err(e) => {
                    self.set_state(LeadershipState::NoLeader);
                    return Err(e);
                }
            }
        }
    }

    /// Leading: wait until the record disappears, the session dies, or shutdown.
    async fn hold(
        &self,
        store: &dyn CoordinationStore,
        mut version: u64,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Step, OrchestratorError> {
        loop {
            let watch = store.watch(LEADER_PATH, WatchScope::Key).await.ok();
            match store.get(LEADER_PATH).await {
                Ok(Some(record)) if record.value.as_str() == Some(self.node_id.as_str()) => {
                    version = record.version;
                }
                Ok(_) => {
                    tracing::warn!(node_id = %self.node_id, "Leader record lost, re-electing");
                    self.set_state(LeadershipState::NoLeader);
                    return Ok(Step::Retry);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to verify leader record");
                }
            }

            tokio::select! {
                _ = wait_event(watch) => {}
                _ = sleep(self.recheck_interval) => {}
                _ = self.session.lost() => {
                    tracing::warn!(node_id = %self.node_id, "Session lost while leading");
                    return Err(OrchestratorError::LeaderLost);
                }
                _ = shutdown.recv() => {
                    // Stop acting as leader before a standby can win the record.
                    self.set_state(LeadershipState::NoLeader);
                    if let Err(e) = store.delete(LEADER_PATH, ExpectedVersion::Exactly(version)).await {
                        tracing::debug!(error = %e, "Failed to delete leader record on shutdown");
                    }
                    return Ok(Step::Shutdown);
                }
            }
        }
    }

    /// Following: wait for the leader record to change.
    async fn follow(
        &self,
        store: &dyn CoordinationStore,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Step, OrchestratorError> {
        let watch = match store.watch(LEADER_PATH, WatchScope::Key).await {
            Ok(watch) => Some(watch),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to watch leader record");
                None
            }
        };

        match current_leader(store).await {
            Ok(None) => return Ok(Step::Retry),
            Ok(Some(leader)) => self.set_state(LeadershipState::Following(leader)),
            Err(e) => tracing::warn!(error = %e, "Failed to read leader record"),
        }

        tokio::select! {
            event = wait_event(watch) => {
                tracing::debug!(%event, "Leader record changed");
                Ok(Step::Retry)
            }
            _ = sleep(self.recheck_interval) => Ok(Step::Retry),
            _ = self.session.lost() => Err(OrchestratorError::LeaderLost),
            _ = shutdown.recv() => Ok(Step::Shutdown),
        }
    }
}

enum Step {
    Retry,
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreHandle};

    async fn node(store: &MemoryStore, id: &str) -> Arc<LeaderElection> {
        let handle: StoreHandle = Arc::new(store.clone());
        let session = Session::open(handle, Duration::from_millis(300)).await.unwrap();
        Arc::new(LeaderElection::new(id, Arc::new(session), Duration::from_millis(200)))
    }

    #[tokio::test]
    async fn test_single_leader_then_failover() {
        let store = MemoryStore::new();
        store.start_reaper(Duration::from_millis(20));
        let shutdown = broadcast::channel::<()>(1).0;

        let a = node(&store, "a").await;
        let b = node(&store, "b").await;
        let ta = tokio::spawn({
            let a = a.clone();
            let rx = shutdown.subscribe();
            async move { a.run(rx).await }
        });
        sleep(Duration::from_millis(50)).await;
        let tb = tokio::spawn({
            let b = b.clone();
            let rx = shutdown.subscribe();
            async move { b.run(rx).await }
        });
        sleep(Duration::from_millis(100)).await;

        assert_eq!(a.state(), LeadershipState::Leading);
        assert_eq!(b.state(), LeadershipState::Following("a".into()));

        store.expire_session(a.session.id());
        assert!(matches!(ta.await.unwrap(), Err(OrchestratorError::LeaderLost)));

        let mut rx = b.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.is_leading()))
            .await
            .expect("standby did not take over")
            .unwrap();
        assert_eq!(current_leader(&store).await.unwrap(), Some("b".into()));

        let _ = shutdown.send(());
        assert!(tb.await.unwrap().is_ok());
        assert_eq!(current_leader(&store).await.unwrap(), None);
    }
}
