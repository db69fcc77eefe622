//! Session/lease client.
//!
//! # Responsibilities
//! - Open a session against the coordination store
//! - Renew it from a background task every `ttl / 3`
//! - Report session death to everything holding ephemeral entries
//! - Revoke it on graceful leave so peers fail over immediately
//!
//! # Design Decisions
//! - A renewal that keeps failing for a full TTL is treated as session death,
//!   even if the store never answered: the entries are gone by then anyway
//! - Session state is published on a `watch` channel; no callbacks

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use super::{Result, SessionId, StoreError, StoreHandle};

/// Liveness of a session as seen by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Live,
    Expired,
    Closed,
}

/// A live session with a background keep-alive task.
#[derive(Debug)]
pub struct Session {
    store: StoreHandle,
    id: SessionId,
    ttl: Duration,
    state_tx: Arc<watch::Sender<SessionState>>,
    keepalive: JoinHandle<()>,
}

impl Session {
    /// Open a session and start renewing it.
    pub async fn open(store: StoreHandle, ttl: Duration) -> Result<Self> {
        let id = store.create_session(ttl).await?;
        let (state_tx, _) = watch::channel(SessionState::Live);
        let state_tx = Arc::new(state_tx);

        let keepalive = {
            let store = store.clone();
            let state_tx = state_tx.clone();
            tokio::spawn(async move {
                let renew_interval = (ttl / 3).max(Duration::from_millis(10));
                let mut last_renewed = Instant::now();
                loop {
                    sleep(renew_interval).await;
                    match store.keep_alive(id).await {
                        Ok(()) => last_renewed = Instant::now(),
                        Err(StoreError::SessionExpired) => {
                            tracing::warn!(session = %id, "Session expired");
                            state_tx.send_replace(SessionState::Expired);
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(session = %id, error = %e, "Failed to renew session");
                            if last_renewed.elapsed() >= ttl {
                                tracing::error!(session = %id, "Session not renewed within TTL, treating as expired");
                                state_tx.send_replace(SessionState::Expired);
                                break;
                            }
                        }
                    }
                }
            })
        };

        tracing::info!(session = %id, ttl_ms = ttl.as_millis() as u64, "Session opened");
        Ok(Self {
            store,
            id,
            ttl,
            state_tx,
            keepalive,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == SessionState::Live
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Resolves once the session is no longer live.
    pub async fn lost(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|s| *s != SessionState::Live).await;
    }

    /// Revoke the session; its ephemeral entries disappear immediately.
    pub async fn close(&self) -> Result<()> {
        self.keepalive.abort();
        if self.state_tx.send_replace(SessionState::Closed) == SessionState::Live {
            self.store.close_session(self.id).await?;
            tracing::info!(session = %self.id, "Session closed");
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CoordinationStore, MemoryStore};
    use serde_json::json;

    #[tokio::test]
    async fn test_keepalive_keeps_entries() {
        let store = MemoryStore::new();
        let handle: StoreHandle = Arc::new(store.clone());
        let session = Session::open(handle, Duration::from_millis(150)).await.unwrap();
        store.create_ephemeral("/lb-nodes/n1", json!({}), session.id()).await.unwrap();

        sleep(Duration::from_millis(500)).await;
        assert!(session.is_live());
        assert!(store.get("/lb-nodes/n1").await.unwrap().is_some());

        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(store.get("/lb-nodes/n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lost_on_expiry() {
        let store = MemoryStore::new();
        let handle: StoreHandle = Arc::new(store.clone());
        let session = Session::open(handle, Duration::from_millis(150)).await.unwrap();

        store.expire_session(session.id());
        tokio::time::timeout(Duration::from_secs(2), session.lost())
            .await
            .expect("session loss not reported");
        assert_eq!(session.state(), SessionState::Expired);
    }
}
