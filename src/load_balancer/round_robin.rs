//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{backend::RoutableBackend, LoadBalancer};

/// Round-robin selector.
/// An atomic cursor advances modulo the eligible count on every pick.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server(&self, eligible: &[Arc<RoutableBackend>]) -> Option<Arc<RoutableBackend>> {
        if eligible.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Some(eligible[index].clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
