//! Routable backend abstraction.
//!
//! # Responsibilities
//! - Represent a single backend of one group snapshot
//! - Track active connections (for Least Connections)
//! - Carry the live health state pushed by the config cache
//! - Accumulate completion stats (success, failure, duration)

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::group::BackendRef;
use crate::health::state::HealthState;

/// A backend as seen by the routing engine.
#[derive(Debug)]
pub struct RoutableBackend {
    pub id: String,
    pub address: String,
    pub weight: u32,

    /// Current health state (see [`HealthState`]).
    health: AtomicU8,
    /// Number of leases not yet completed.
    active_connections: AtomicUsize,

    successes: AtomicU64,
    failures: AtomicU64,
    total_duration_us: AtomicU64,
}

impl RoutableBackend {
    pub fn new(backend: &BackendRef, health: HealthState) -> Self {
        Self {
            id: backend.id.clone(),
            address: backend.address.clone(),
            weight: backend.weight.max(1),
            health: AtomicU8::new(health as u8),
            active_connections: AtomicUsize::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_duration_us: AtomicU64::new(0),
        }
    }

    pub fn health(&self) -> HealthState {
        HealthState::from(self.health.load(Ordering::Acquire))
    }

    /// Returns true if the state changed.
    pub fn set_health(&self, state: HealthState) -> bool {
        self.health.swap(state as u8, Ordering::AcqRel) != state as u8
    }

    /// Only HEALTHY backends receive traffic; DRAINING and UNKNOWN do not.
    pub fn is_eligible(&self) -> bool {
        self.health() == HealthState::Healthy
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Dispatch to this backend. The lease decrements the counter when done.
    pub fn lease(self: &Arc<Self>, group: &str) -> BackendLease {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
        BackendLease {
            backend: self.clone(),
            group: group.to_string(),
            completed: false,
        }
    }

    fn release(&self) {
        // Never wraps below zero, even on a double release bug.
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            id: self.id.clone(),
            address: self.address.clone(),
            weight: self.weight,
            health: self.health(),
            active_connections: self.active_connections(),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_duration_ms: self.total_duration_us.load(Ordering::Relaxed) / 1_000,
        }
    }
}

/// Result of a dispatched request, reported by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Point-in-time view of one backend, for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub id: String,
    pub address: String,
    pub weight: u32,
    pub health: HealthState,
    pub active_connections: usize,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
}

/// A RAII guard for one dispatched request.
///
/// Call [`complete`](Self::complete) with the outcome; dropping an
/// uncompleted lease only releases the connection slot.
#[derive(Debug)]
pub struct BackendLease {
    backend: Arc<RoutableBackend>,
    group: String,
    completed: bool,
}

impl BackendLease {
    pub fn address(&self) -> &str {
        &self.backend.address
    }

    pub fn backend_id(&self) -> &str {
        &self.backend.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn backend(&self) -> &Arc<RoutableBackend> {
        &self.backend
    }

    /// Report completion of the request.
    pub fn complete(mut self, outcome: Outcome, duration: Duration) {
        let backend = &self.backend;
        match outcome {
            Outcome::Success => backend.successes.fetch_add(1, Ordering::Relaxed),
            Outcome::Failure => backend.failures.fetch_add(1, Ordering::Relaxed),
        };
        backend
            .total_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.completed = true;
        backend.release();
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        if !self.completed {
            self.backend.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Arc<RoutableBackend> {
        let r = BackendRef {
            id: "b1".into(),
            address: "10.0.0.1:8080".into(),
            weight: 1,
        };
        Arc::new(RoutableBackend::new(&r, HealthState::Healthy))
    }

    #[test]
    fn test_lease_counts() {
        let b = backend();
        let l1 = b.lease("api");
        let l2 = b.lease("api");
        assert_eq!(b.active_connections(), 2);

        l1.complete(Outcome::Success, Duration::from_millis(20));
        assert_eq!(b.active_connections(), 1);

        drop(l2);
        assert_eq!(b.active_connections(), 0);

        let stats = b.stats();
        assert_eq!((stats.successes, stats.failures), (1, 0));
        assert_eq!(stats.total_duration_ms, 20);
    }

    #[test]
    fn test_eligibility() {
        let b = backend();
        assert!(b.is_eligible());
        assert!(b.set_health(HealthState::Draining));
        assert!(!b.is_eligible());
        assert!(!b.set_health(HealthState::Draining));
        b.set_health(HealthState::Unknown);
        assert!(!b.is_eligible());
    }
}
