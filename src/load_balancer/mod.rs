//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! select_backend(group)
//!     → engine.rs (current GroupSnapshot from the config cache)
//!     → eligible = HEALTHY backends in config order
//!     → Apply the group's algorithm:
//!         - round_robin.rs (atomic cursor)
//!         - weighted.rs (smooth weighted round robin)
//!         - least_conn.rs (fewest active leases, lowest id on tie)
//!     → backend.rs BackendLease (active count +1 until completed)
//! ```
//!
//! # Design Decisions
//! - Selector state lives in the snapshot and is rebuilt with it
//! - Unhealthy, unknown and draining backends are excluded from selection
//! - No locks on the hot path except the WRR score vector

pub mod backend;
pub mod engine;
pub mod least_conn;
pub mod round_robin;
pub mod weighted;

pub use backend::{BackendLease, BackendStats, Outcome, RoutableBackend};
pub use engine::RoutingEngine;
pub use weighted::smooth_wrr_next;

use std::sync::Arc;
use thiserror::Error;

use crate::config::group::SelectionAlgorithm;

/// A backend selection strategy.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    /// Pick one of `eligible`, or `None` if it is empty.
    fn next_server(&self, eligible: &[Arc<RoutableBackend>]) -> Option<Arc<RoutableBackend>>;

    fn name(&self) -> &'static str;
}

/// Build the selector for an algorithm.
pub fn selector_for(algorithm: SelectionAlgorithm) -> Box<dyn LoadBalancer> {
    match algorithm {
        SelectionAlgorithm::RoundRobin => Box::new(round_robin::RoundRobin::new()),
        SelectionAlgorithm::WeightedRoundRobin => Box::new(weighted::SmoothWeighted::new()),
        SelectionAlgorithm::LeastConnections => Box::new(least_conn::LeastConnections::new()),
    }
}

/// Routing failures surfaced to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The group has no (valid) configuration on this node.
    #[error("no configuration for group {0}")]
    ConfigNotFound(String),

    /// Every backend of the group is unhealthy, unknown or draining.
    #[error("no eligible backend in group {0}")]
    BackendPoolEmpty(String),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::group::BackendRef;
    use crate::health::state::HealthState;

    /// Healthy backends in the given order.
    pub(crate) fn backends(spec: &[(&str, u32)]) -> Vec<Arc<RoutableBackend>> {
        spec.iter()
            .enumerate()
            .map(|(i, (id, weight))| {
                let r = BackendRef {
                    id: id.to_string(),
                    address: format!("10.0.0.{}:8080", i + 1),
                    weight: *weight,
                };
                Arc::new(RoutableBackend::new(&r, HealthState::Healthy))
            })
            .collect()
    }
}
