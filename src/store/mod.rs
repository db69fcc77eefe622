//! Coordination store subsystem.
//!
//! # Data Flow
//! ```text
//! orchestrator / cache / discovery
//!     → CoordinationStore (trait)
//!         - memory.rs (in-process, single-node and tests)
//!         - etcd.rs   (etcd v3 cluster)
//!     → session.rs keeps a lease alive for ephemeral entries
//!     → watch.rs one-shot notifications, consumer re-fetches
//! ```
//!
//! # Design Decisions
//! - Values are JSON documents; versions are store revisions
//! - Compare-and-set on version for every contended write
//! - Ephemeral entries are bound to a session and vanish with it
//! - Watches fire once and carry no payload

pub mod error;
pub mod etcd;
pub mod memory;
pub mod paths;
pub mod session;
pub mod watch;

pub use error::{Result, StoreError};
pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use session::{Session, SessionState};
pub use watch::{wait_event, Watch, WatchEvent, WatchKind, WatchScope};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::schema::{StoreBackend, StoreConfig};

/// Store revision of the last write to a key.
pub type Version = u64;

/// Identifier of a session (an etcd lease id for the etcd backend).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub i64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A value together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub value: Value,
    pub version: Version,
}

impl Versioned {
    /// Decode the JSON value into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

/// Precondition for a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Unconditional.
    Any,
    /// The key must not exist.
    Absent,
    /// The key must exist at exactly this version.
    Exactly(Version),
}

/// Shared handle used by every component.
pub type StoreHandle = Arc<dyn CoordinationStore>;

/// Strongly consistent hierarchical key/value store with sessions and watches.
#[async_trait]
pub trait CoordinationStore: Send + Sync + std::fmt::Debug + 'static {
    /// Open a session whose ephemeral entries vanish `ttl` after the last keep-alive.
    async fn create_session(&self, ttl: Duration) -> Result<SessionId>;

    /// Renew a session. Fails with `SessionExpired` if it is already gone.
    async fn keep_alive(&self, session: SessionId) -> Result<()>;

    /// End a session and remove its ephemeral entries immediately.
    async fn close_session(&self, session: SessionId) -> Result<()>;

    /// Create `path` bound to `session`. Fails with `NodeExists` if present.
    async fn create_ephemeral(&self, path: &str, value: Value, session: SessionId)
        -> Result<Version>;

    /// Read one key.
    async fn get(&self, path: &str) -> Result<Option<Versioned>>;

    /// Read every key strictly below `prefix`, ordered by path.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;

    /// Write `path`. Keeps an existing entry's session binding.
    async fn set(&self, path: &str, value: Value, expected: ExpectedVersion) -> Result<Version>;

    /// Delete `path`. Deleting a missing key with `ExpectedVersion::Any` is not an error.
    async fn delete(&self, path: &str, expected: ExpectedVersion) -> Result<()>;

    /// Register a one-shot watch.
    async fn watch(&self, path: &str, scope: WatchScope) -> Result<Watch>;
}

/// Build the configured store backend.
pub async fn connect(config: &StoreConfig) -> Result<StoreHandle> {
    match config.backend {
        StoreBackend::Memory => {
            let store = MemoryStore::new();
            store.start_reaper(Duration::from_millis(config.reap_interval_ms));
            Ok(Arc::new(store))
        }
        StoreBackend::Etcd => {
            let store = EtcdStore::connect(&config.endpoints).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Read and decode a typed record.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn CoordinationStore,
    path: &str,
) -> Result<Option<(T, Version)>> {
    match store.get(path).await? {
        Some(versioned) => Ok(Some((versioned.decode()?, versioned.version))),
        None => Ok(None),
    }
}

/// Read-modify-write with compare-and-set, retrying on `VersionConflict`.
///
/// `update` receives the current record (if any) and returns the record to
/// write, or `None` to leave the key untouched.
pub async fn update_json<T, F>(
    store: &dyn CoordinationStore,
    path: &str,
    max_attempts: u32,
    mut update: F,
) -> Result<Option<Version>>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> Option<T>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = get_json::<T>(store, path).await?;
        let expected = match &current {
            Some((_, version)) => ExpectedVersion::Exactly(*version),
            None => ExpectedVersion::Absent,
        };
        let Some(next) = update(current.map(|(record, _)| record)) else {
            return Ok(None);
        };
        match store.set(path, serde_json::to_value(&next)?, expected).await {
            Ok(version) => return Ok(Some(version)),
            Err(StoreError::VersionConflict { .. }) | Err(StoreError::NodeExists(_))
                if attempt < max_attempts =>
            {
                tracing::debug!(path = %path, attempt, "Version conflict, retrying with fresh read");
            }
            Err(StoreError::NodeExists(path)) => {
                return Err(StoreError::VersionConflict { path })
            }
            Err(e) => return Err(e),
        }
    }
}
