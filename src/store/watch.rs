//! One-shot change notifications.
//!
//! A [`Watch`] fires at most once. The event names the changed path but
//! carries no value: consumers re-fetch and then arm a new watch.

use std::fmt;
use tokio::sync::oneshot;

/// What happened to the watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Put,
    Delete,
}

/// A single change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchKind,
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            WatchKind::Put => write!(f, "Put({})", self.path),
            WatchKind::Delete => write!(f, "Delete({})", self.path),
        }
    }
}

/// Which paths a registration covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchScope {
    /// Exactly the watched path.
    Key,
    /// The watched path and every path below it.
    Prefix,
}

impl WatchScope {
    /// Returns true if a change to `path` should fire a watch on `watched`.
    pub fn covers(&self, watched: &str, path: &str) -> bool {
        match self {
            WatchScope::Key => watched == path,
            WatchScope::Prefix => {
                let watched = watched.trim_end_matches('/');
                path == watched
                    || (path.starts_with(watched) && path[watched.len()..].starts_with('/'))
            }
        }
    }
}

/// A one-shot watch registration.
#[derive(Debug)]
pub struct Watch {
    path: String,
    rx: oneshot::Receiver<WatchEvent>,
}

impl Watch {
    pub fn new(path: impl Into<String>, rx: oneshot::Receiver<WatchEvent>) -> Self {
        Self {
            path: path.into(),
            rx,
        }
    }

    /// The path this watch was registered on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the notification.
    ///
    /// Returns `None` when the store dropped the registration without firing
    /// (lost notification). Callers fall back to their reconciliation tick.
    pub async fn fired(self) -> Option<WatchEvent> {
        self.rx.await.ok()
    }
}

/// Wait on an optional watch inside a `select!`.
///
/// Never resolves if there is no watch or its notification was lost, so the
/// surrounding loop is driven by its other branches (reconcile tick, shutdown).
pub async fn wait_event(watch: Option<Watch>) -> WatchEvent {
    if let Some(watch) = watch {
        if let Some(event) = watch.fired().await {
            return event;
        }
    }
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_covers() {
        assert!(WatchScope::Key.covers("/a/b", "/a/b"));
        assert!(!WatchScope::Key.covers("/a/b", "/a/b/c"));
        assert!(WatchScope::Prefix.covers("/a", "/a/b/c"));
        assert!(WatchScope::Prefix.covers("/a/", "/a/b"));
        assert!(!WatchScope::Prefix.covers("/a", "/ab"));
    }
}
