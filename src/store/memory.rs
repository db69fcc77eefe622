//! In-process coordination store.
//!
//! Linearizable by construction: every operation runs under one mutex.
//! Sessions expire `ttl` after their last keep-alive; expiry is applied
//! lazily on every call and eagerly by the optional reaper task, so watches
//! on ephemeral entries fire even when nobody touches the store.
//!
//! Used by single-process deployments and by the test suite, which also
//! relies on the fault hooks (`expire_session`, `set_available`,
//! `set_notifications_enabled`).

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{
    CoordinationStore, ExpectedVersion, Result, SessionId, StoreError, Version, Versioned, Watch,
    WatchEvent, WatchKind, WatchScope,
};

#[derive(Debug)]
struct Entry {
    value: Value,
    version: Version,
    owner: Option<SessionId>,
}

#[derive(Debug)]
struct SessionEntry {
    ttl: Duration,
    deadline: Instant,
}

#[derive(Debug)]
struct Registration {
    path: String,
    scope: WatchScope,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Debug, Default)]
struct State {
    revision: u64,
    next_session: i64,
    entries: BTreeMap<String, Entry>,
    sessions: HashMap<SessionId, SessionEntry>,
    watches: Vec<Registration>,
}

/// In-memory implementation of [`CoordinationStore`].
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    available: Arc<AtomicBool>,
    notifications: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            available: Arc::new(AtomicBool::new(true)),
            notifications: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Spawn a background task that expires dead sessions every `interval`.
    ///
    /// The task stops once every handle to the store is dropped.
    pub fn start_reaper(&self, interval: Duration) {
        let state: Weak<Mutex<State>> = Arc::downgrade(&self.state);
        let notifications = self.notifications.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(state) = state.upgrade() else {
                    break;
                };
                let mut guard = state.lock();
                let events = reap(&mut guard);
                fire(&mut guard, events, notifications.load(Ordering::SeqCst));
            }
        });
    }

    /// Kill a session as if its owner crashed. Its ephemeral entries vanish.
    pub fn expire_session(&self, session: SessionId) {
        let mut state = self.state.lock();
        if state.sessions.remove(&session).is_some() {
            tracing::debug!(session = %session, "Session force-expired");
            let events = drop_owned(&mut state, session);
            fire(&mut state, events, self.notifications_enabled());
        }
    }

    /// Simulate the store becoming unreachable (`StoreUnavailable` on every call).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// When disabled, watches that would fire are discarded instead (lost notifications).
    pub fn set_notifications_enabled(&self, enabled: bool) {
        self.notifications.store(enabled, Ordering::SeqCst);
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        let mut state = self.state.lock();
        let events = reap(&mut state);
        fire(&mut state, events, self.notifications_enabled());
        state.sessions.len()
    }

    /// Owner session of an entry, if it is ephemeral.
    pub fn owner_of(&self, path: &str) -> Option<SessionId> {
        self.state.lock().entries.get(path).and_then(|e| e.owner)
    }

    fn notifications_enabled(&self) -> bool {
        self.notifications.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        }
    }

    /// Lock the state after expiring dead sessions.
    fn live_state(&self) -> Result<parking_lot::MutexGuard<'_, State>> {
        self.check_available()?;
        let mut state = self.state.lock();
        let events = reap(&mut state);
        fire(&mut state, events, self.notifications_enabled());
        Ok(state)
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn check_expected(path: &str, entry: Option<&Entry>, expected: ExpectedVersion) -> Result<()> {
    match (expected, entry) {
        (ExpectedVersion::Any, _) => Ok(()),
        (ExpectedVersion::Absent, None) => Ok(()),
        (ExpectedVersion::Absent, Some(_)) => Err(StoreError::NodeExists(path.to_string())),
        (ExpectedVersion::Exactly(_), None) => Err(StoreError::NotFound(path.to_string())),
        (ExpectedVersion::Exactly(v), Some(e)) if e.version == v => Ok(()),
        (ExpectedVersion::Exactly(_), Some(_)) => Err(StoreError::VersionConflict {
            path: path.to_string(),
        }),
    }
}

fn reap(state: &mut State) -> Vec<WatchEvent> {
    let now = Instant::now();
    let expired: Vec<SessionId> = state
        .sessions
        .iter()
        .filter(|(_, s)| s.deadline <= now)
        .map(|(id, _)| *id)
        .collect();

    let mut events = Vec::new();
    for id in expired {
        state.sessions.remove(&id);
        tracing::debug!(session = %id, "Session expired");
        events.extend(drop_owned(state, id));
    }
    events
}

fn drop_owned(state: &mut State, session: SessionId) -> Vec<WatchEvent> {
    let owned: Vec<String> = state
        .entries
        .iter()
        .filter(|(_, e)| e.owner == Some(session))
        .map(|(k, _)| k.clone())
        .collect();

    let mut events = Vec::with_capacity(owned.len());
    for path in owned {
        state.entries.remove(&path);
        state.revision += 1;
        events.push(WatchEvent {
            path,
            kind: WatchKind::Delete,
        });
    }
    events
}

fn fire(state: &mut State, events: Vec<WatchEvent>, deliver: bool) {
    for event in events {
        let (hit, keep): (Vec<Registration>, Vec<Registration>) = std::mem::take(&mut state.watches)
            .into_iter()
            .partition(|r| r.scope.covers(&r.path, &event.path));
        state.watches = keep;
        if deliver {
            for registration in hit {
                let _ = registration.tx.send(event.clone());
            }
        }
    }
    // Receivers that went away no longer need their registration.
    state.watches.retain(|r| !r.tx.is_closed());
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn create_session(&self, ttl: Duration) -> Result<SessionId> {
        let mut state = self.live_state()?;
        state.next_session += 1;
        let id = SessionId(state.next_session);
        state.sessions.insert(
            id,
            SessionEntry {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, session: SessionId) -> Result<()> {
        let mut state = self.live_state()?;
        match state.sessions.get_mut(&session) {
            Some(entry) => {
                entry.deadline = Instant::now() + entry.ttl;
                Ok(())
            }
            None => Err(StoreError::SessionExpired),
        }
    }

    async fn close_session(&self, session: SessionId) -> Result<()> {
        let mut state = self.live_state()?;
        if state.sessions.remove(&session).is_some() {
            let events = drop_owned(&mut state, session);
            fire(&mut state, events, self.notifications_enabled());
        }
        Ok(())
    }

    async fn create_ephemeral(
        &self,
        path: &str,
        value: Value,
        session: SessionId,
    ) -> Result<Version> {
        validate_path(path)?;
        let mut state = self.live_state()?;
        if !state.sessions.contains_key(&session) {
            return Err(StoreError::SessionExpired);
        }
        if state.entries.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        state.revision += 1;
        let version = state.revision;
        state.entries.insert(
            path.to_string(),
            Entry {
                value,
                version,
                owner: Some(session),
            },
        );
        fire(
            &mut state,
            vec![WatchEvent {
                path: path.to_string(),
                kind: WatchKind::Put,
            }],
            self.notifications_enabled(),
        );
        Ok(version)
    }

    async fn get(&self, path: &str) -> Result<Option<Versioned>> {
        validate_path(path)?;
        let state = self.live_state()?;
        Ok(state.entries.get(path).map(|e| Versioned {
            value: e.value.clone(),
            version: e.version,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let state = self.live_state()?;
        let base = format!("{}/", prefix.trim_end_matches('/'));
        Ok(state
            .entries
            .range(base.clone()..)
            .take_while(|(k, _)| k.starts_with(&base))
            .map(|(k, e)| {
                (
                    k.clone(),
                    Versioned {
                        value: e.value.clone(),
                        version: e.version,
                    },
                )
            })
            .collect())
    }

    async fn set(&self, path: &str, value: Value, expected: ExpectedVersion) -> Result<Version> {
        validate_path(path)?;
        let mut state = self.live_state()?;
        check_expected(path, state.entries.get(path), expected)?;
        state.revision += 1;
        let version = state.revision;
        let owner = state.entries.get(path).and_then(|e| e.owner);
        state.entries.insert(
            path.to_string(),
            Entry {
                value,
                version,
                owner,
            },
        );
        fire(
            &mut state,
            vec![WatchEvent {
                path: path.to_string(),
                kind: WatchKind::Put,
            }],
            self.notifications_enabled(),
        );
        Ok(version)
    }

    async fn delete(&self, path: &str, expected: ExpectedVersion) -> Result<()> {
        validate_path(path)?;
        let mut state = self.live_state()?;
        if expected == ExpectedVersion::Any && !state.entries.contains_key(path) {
            return Ok(());
        }
        if expected == ExpectedVersion::Absent {
            return match state.entries.contains_key(path) {
                true => Err(StoreError::VersionConflict {
                    path: path.to_string(),
                }),
                false => Ok(()),
            };
        }
        check_expected(path, state.entries.get(path), expected)?;
        state.entries.remove(path);
        state.revision += 1;
        fire(
            &mut state,
            vec![WatchEvent {
                path: path.to_string(),
                kind: WatchKind::Delete,
            }],
            self.notifications_enabled(),
        );
        Ok(())
    }

    async fn watch(&self, path: &str, scope: WatchScope) -> Result<Watch> {
        let mut state = self.live_state()?;
        let (tx, rx) = oneshot::channel();
        state.watches.push(Registration {
            path: path.to_string(),
            scope,
            tx,
        });
        Ok(Watch::new(path, rx))
    }
}
