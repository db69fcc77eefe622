//! Routing engine: one `select_backend` call per inbound request.

use std::sync::Arc;

use crate::cache::ConfigCache;
use crate::load_balancer::{BackendLease, RoutingError};
use crate::observability::metrics;

/// Selects backends from the node's current config snapshot.
#[derive(Debug, Clone)]
pub struct RoutingEngine {
    cache: Arc<ConfigCache>,
}

impl RoutingEngine {
    pub fn new(cache: Arc<ConfigCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ConfigCache> {
        &self.cache
    }

    /// Pick a backend for `group` and take a lease on it.
    pub fn select_backend(&self, group: &str) -> Result<BackendLease, RoutingError> {
        let snapshot = self
            .cache
            .group(group)
            .ok_or_else(|| RoutingError::ConfigNotFound(group.to_string()))?;

        match snapshot.select() {
            Some(backend) => {
                metrics::record_selection(group, &snapshot.algorithm().to_string());
                let lease = backend.lease(group);
                metrics::record_active_connections(group, &backend.id, backend.active_connections());
                tracing::trace!(group = %group, backend = %backend.id, address = %backend.address, "Backend selected");
                Ok(lease)
            }
            None => {
                metrics::record_pool_empty(group);
                tracing::debug!(
                    group = %group,
                    backend_count = snapshot.backends().len(),
                    "No eligible backend in group"
                );
                Err(RoutingError::BackendPoolEmpty(group.to_string()))
            }
        }
    }
}
