//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::RoutableBackend, LoadBalancer};

/// Least connections selector.
/// Picks the minimum active count; ties go to the lowest backend id.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(&self, eligible: &[Arc<RoutableBackend>]) -> Option<Arc<RoutableBackend>> {
        eligible
            .iter()
            .min_by(|a, b| {
                a.active_connections()
                    .cmp(&b.active_connections())
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned()
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::tests::backends;

    #[test]
    fn test_least_conn() {
        let lb = LeastConnections::new();
        let pool = backends(&[("b1", 1), ("b2", 1)]);

        let _l1 = pool[0].lease("api");
        assert_eq!(lb.next_server(&pool).unwrap().id, "b2");

        let _l2 = pool[1].lease("api");
        let _l3 = pool[1].lease("api");
        assert_eq!(lb.next_server(&pool).unwrap().id, "b1");
    }

    #[test]
    fn test_tie_break_is_stable() {
        let lb = LeastConnections::new();
        // Config order differs from id order.
        let pool = backends(&[("b9", 1), ("b2", 1), ("b5", 1)]);
        for _ in 0..10 {
            assert_eq!(lb.next_server(&pool).unwrap().id, "b2");
        }
    }
}
