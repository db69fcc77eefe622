//! Backend health state machine.
//!
//! # States
//! - Unknown: initial, never probed to a verdict
//! - Healthy: eligible for selection
//! - Unhealthy: excluded from selection
//! - Draining: set externally, excluded, ignores probe results
//!
//! # State Transitions
//! ```text
//! Unknown|Unhealthy → Healthy: consecutive successes >= success_threshold
//! Unknown|Healthy → Unhealthy: consecutive failures >= failure_threshold
//! Draining → *: only by an external undrain (admin)
//! ```
//!
//! # Design Decisions
//! - Hysteresis prevents flapping
//! - Counters reset on every transition
//! - Pure: the caller decides what to persist (transitions only)

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::group::HealthCheckSpec;

/// Health state of one backend.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    #[default]
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
    Draining = 3,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            3 => HealthState::Draining,
            _ => HealthState::Unknown,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthState::Unknown => "UNKNOWN",
            HealthState::Healthy => "HEALTHY",
            HealthState::Unhealthy => "UNHEALTHY",
            HealthState::Draining => "DRAINING",
        };
        f.write_str(name)
    }
}

/// Identity of a backend across groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct BackendKey {
    pub group: String,
    pub backend_id: String,
}

impl BackendKey {
    pub fn new(group: impl Into<String>, backend_id: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            backend_id: backend_id.into(),
        }
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.backend_id)
    }
}

/// Result of one probe as seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure,
}

/// A state change produced by [`BackendHealthRecord::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
}

/// Persisted health of a backend at `/health/<group>/<backendId>`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackendHealthRecord {
    pub group: String,
    pub backend_id: String,
    pub state: HealthState,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,

    /// Unix millis of the last state change.
    pub last_transition_ms: u64,
}

impl BackendHealthRecord {
    pub fn new(group: impl Into<String>, backend_id: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            backend_id: backend_id.into(),
            state: HealthState::Unknown,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_transition_ms: 0,
        }
    }

    pub fn key(&self) -> BackendKey {
        BackendKey::new(self.group.clone(), self.backend_id.clone())
    }

    /// Apply a probe outcome. Returns the transition if the state changed.
    pub fn observe(
        &mut self,
        outcome: ProbeOutcome,
        check: &HealthCheckSpec,
        now_ms: u64,
    ) -> Option<Transition> {
        if self.state == HealthState::Draining {
            return None;
        }

        let target = match outcome {
            ProbeOutcome::Success => {
                self.consecutive_failures = 0;
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                (self.state != HealthState::Healthy
                    && self.consecutive_successes >= check.success_threshold)
                    .then_some(HealthState::Healthy)
            }
            ProbeOutcome::Failure => {
                self.consecutive_successes = 0;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                (self.state != HealthState::Unhealthy
                    && self.consecutive_failures >= check.failure_threshold)
                    .then_some(HealthState::Unhealthy)
            }
        };

        target.map(|to| self.transition_to(to, now_ms))
    }

    /// Force a state (admin drain/undrain). Returns the transition if it changed.
    pub fn set_state(&mut self, state: HealthState, now_ms: u64) -> Option<Transition> {
        if self.state == state {
            return None;
        }
        Some(self.transition_to(state, now_ms))
    }

    fn transition_to(&mut self, to: HealthState, now_ms: u64) -> Transition {
        let from = self.state;
        self.state = to;
        self.consecutive_successes = 0;
        self.consecutive_failures = 0;
        self.last_transition_ms = now_ms;
        Transition { from, to }
    }
}

/// Current wall-clock time in Unix millis.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check() -> HealthCheckSpec {
        HealthCheckSpec {
            failure_threshold: 3,
            success_threshold: 2,
            ..HealthCheckSpec::default()
        }
    }

    #[test]
    fn test_unknown_to_healthy() {
        let mut r = BackendHealthRecord::new("api", "b1");
        assert_eq!(r.observe(ProbeOutcome::Success, &check(), 1), None);
        let t = r.observe(ProbeOutcome::Success, &check(), 2).unwrap();
        assert_eq!(t, Transition { from: HealthState::Unknown, to: HealthState::Healthy });
        assert_eq!(r.consecutive_successes, 0);
        assert_eq!(r.last_transition_ms, 2);
    }

    #[test]
    fn test_unhealthy_exactly_at_threshold() {
        let mut r = BackendHealthRecord::new("api", "b1");
        r.set_state(HealthState::Healthy, 0);

        assert_eq!(r.observe(ProbeOutcome::Failure, &check(), 1), None);
        assert_eq!(r.observe(ProbeOutcome::Failure, &check(), 2), None);
        assert_eq!(r.state, HealthState::Healthy);

        let t = r.observe(ProbeOutcome::Failure, &check(), 3).unwrap();
        assert_eq!(t.to, HealthState::Unhealthy);
        assert_eq!((r.consecutive_failures, r.consecutive_successes), (0, 0));

        // Further failures count but never re-transition.
        for i in 0..5 {
            assert_eq!(r.observe(ProbeOutcome::Failure, &check(), 4 + i), None);
        }
        assert_eq!(r.consecutive_failures, 5);
    }

    #[test]
    fn test_success_resets_failures() {
        let mut r = BackendHealthRecord::new("api", "b1");
        r.set_state(HealthState::Healthy, 0);
        r.observe(ProbeOutcome::Failure, &check(), 1);
        r.observe(ProbeOutcome::Failure, &check(), 2);
        r.observe(ProbeOutcome::Success, &check(), 3);
        assert_eq!(r.consecutive_failures, 0);
        r.observe(ProbeOutcome::Failure, &check(), 4);
        r.observe(ProbeOutcome::Failure, &check(), 5);
        assert_eq!(r.state, HealthState::Healthy);
    }

    #[test]
    fn test_draining_ignores_probes() {
        let mut r = BackendHealthRecord::new("api", "b1");
        r.set_state(HealthState::Draining, 0);
        for i in 0..10 {
            assert_eq!(r.observe(ProbeOutcome::Success, &check(), i), None);
        }
        assert_eq!(r.state, HealthState::Draining);
        assert_eq!(r.consecutive_successes, 0);
    }

    #[test]
    fn test_record_wire_format() {
        let r = BackendHealthRecord::new("api", "b1");
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["state"], "UNKNOWN");
        assert_eq!(v["backend_id"], "b1");
    }
}
