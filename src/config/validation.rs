//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Group invariants: unique backend ids, weight >= 1, sane health checks
//! - Node config sanity: timeouts > 0, endpoints present for etcd
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Pure functions: config → Result<(), Vec<ValidationError>>
//! - A group that fails validation is never applied; the previous version stays

use std::collections::HashSet;
use std::fmt;
use url::Url;

use crate::config::group::LbGroupConfig;
use crate::config::schema::{NodeConfig, StoreBackend};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

fn is_path_segment(s: &str) -> bool {
    !s.is_empty() && !s.contains('/') && !s.chars().any(char::is_whitespace)
}

/// Check that `address` is a `host:port` pair with an explicit, non-zero port.
fn is_host_port(address: &str) -> bool {
    let port = match address.rsplit_once(':').map(|(_, p)| p.parse::<u16>()) {
        Some(Ok(port)) if port > 0 => port,
        _ => return false,
    };
    // `Url::port()` hides the scheme default, so compare against the parsed suffix.
    match Url::parse(&format!("http://{}", address)) {
        Ok(url) => {
            url.host_str().is_some_and(|h| !h.is_empty())
                && url.port_or_known_default() == Some(port)
                && url.path() == "/"
        }
        Err(_) => false,
    }
}

/// Validate a group record.
pub fn validate_group(group: &LbGroupConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !is_path_segment(&group.name) {
        errors.push(ValidationError::new("name", format!("invalid group name {:?}", group.name)));
    }
    if group.backends.is_empty() {
        errors.push(ValidationError::new("backends", "group has no backends"));
    }

    let mut seen = HashSet::new();
    for (i, backend) in group.backends.iter().enumerate() {
        let field = format!("backends[{}]", i);
        if !is_path_segment(&backend.id) {
            errors.push(ValidationError::new(&field, format!("invalid backend id {:?}", backend.id)));
        }
        if !seen.insert(backend.id.as_str()) {
            errors.push(ValidationError::new(&field, format!("duplicate backend id {:?}", backend.id)));
        }
        if backend.weight < 1 {
            errors.push(ValidationError::new(&field, "weight must be >= 1"));
        }
        if !is_host_port(&backend.address) {
            errors.push(ValidationError::new(&field, format!("address {:?} is not host:port", backend.address)));
        }
    }

    let hc = &group.health_check;
    if !hc.path.starts_with('/') {
        errors.push(ValidationError::new("health_check.path", "must start with '/'"));
    }
    if !(100..=599).contains(&hc.expected_status) {
        errors.push(ValidationError::new("health_check.expected_status", "not an HTTP status code"));
    }
    if hc.interval_ms == 0 {
        errors.push(ValidationError::new("health_check.interval_ms", "must be > 0"));
    }
    if hc.timeout_ms == 0 {
        errors.push(ValidationError::new("health_check.timeout_ms", "must be > 0"));
    }
    if hc.failure_threshold == 0 {
        errors.push(ValidationError::new("health_check.failure_threshold", "must be >= 1"));
    }
    if hc.success_threshold == 0 {
        errors.push(ValidationError::new("health_check.success_threshold", "must be >= 1"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate the node configuration.
pub fn validate_config(config: &NodeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !is_path_segment(&config.node.id) {
        errors.push(ValidationError::new("node.id", "must be a non-empty path segment"));
    }
    if config.store.backend == StoreBackend::Etcd && config.store.endpoints.is_empty() {
        errors.push(ValidationError::new("store.endpoints", "etcd backend needs at least one endpoint"));
    }
    if config.store.session_ttl_ms == 0 {
        errors.push(ValidationError::new("store.session_ttl_ms", "must be > 0"));
    }
    if config.store.cas_max_attempts == 0 {
        errors.push(ValidationError::new("store.cas_max_attempts", "must be >= 1"));
    }
    if config.load_balancer.enabled && !is_host_port(&config.load_balancer.advertise_address) {
        errors.push(ValidationError::new("load_balancer.advertise_address", "must be host:port"));
    }
    if config.load_balancer.reconcile_interval_ms == 0 {
        errors.push(ValidationError::new("load_balancer.reconcile_interval_ms", "must be > 0"));
    }
    if config.orchestrator.max_in_flight_probes == 0 {
        errors.push(ValidationError::new("orchestrator.max_in_flight_probes", "must be >= 1"));
    }
    if config.orchestrator.probe_tick_ms == 0 || config.orchestrator.reassign_interval_ms == 0 {
        errors.push(ValidationError::new("orchestrator", "intervals must be > 0"));
    }
    if config.orchestrator.virtual_nodes == 0 {
        errors.push(ValidationError::new("orchestrator.virtual_nodes", "must be >= 1"));
    }
    if let Some(vip) = &config.discovery.vip {
        if vip.missed_heartbeats == 0 {
            errors.push(ValidationError::new("discovery.vip.missed_heartbeats", "must be >= 1"));
        }
        if vip.heartbeat_interval_ms == 0 {
            errors.push(ValidationError::new("discovery.vip.heartbeat_interval_ms", "must be > 0"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::group::{BackendRef, HealthCheckSpec, SelectionAlgorithm};

    fn group() -> LbGroupConfig {
        LbGroupConfig {
            name: "api".into(),
            backends: vec![
                BackendRef { id: "b1".into(), address: "10.0.0.1:8080".into(), weight: 5 },
                BackendRef { id: "b2".into(), address: "backend-2.internal:80".into(), weight: 1 },
            ],
            health_check: HealthCheckSpec::default(),
            algorithm: SelectionAlgorithm::RoundRobin,
            version: 1,
        }
    }

    #[test]
    fn test_valid_group() {
        assert!(validate_group(&group()).is_ok());
    }

    #[test]
    fn test_default_http_port_is_accepted() {
        let mut g = group();
        g.backends[0].address = "10.0.0.1:80".into();
        g.backends[1].address = "[::1]:80".into();
        assert!(validate_group(&g).is_ok());

        for bad in ["10.0.0.1", "10.0.0.1:", "10.0.0.1:0", ":8080", "10.0.0.1:8080/x"] {
            g.backends[0].address = bad.into();
            assert!(validate_group(&g).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_collects_all_errors() {
        let mut g = group();
        g.backends[1].id = "b1".into();
        g.backends[1].weight = 0;
        g.backends[0].address = "no-port".into();
        g.health_check.failure_threshold = 0;

        let errors = validate_group(&g).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.message.contains("duplicate")));
    }

    #[test]
    fn test_default_node_config_is_valid() {
        assert!(validate_config(&NodeConfig::default()).is_ok());
    }
}
