//! Metrics collection and exposition.
//!
//! # Metrics
//! - `lb_selections_total` (counter): selections by group, algorithm
//! - `lb_pool_empty_total` (counter): BackendPoolEmpty by group
//! - `lb_backend_active_connections` (gauge): leases in flight by group, backend
//! - `lb_probes_total` (counter): probes by group, outcome
//! - `lb_probe_duration_seconds` (histogram)
//! - `lb_health_transitions_total` (counter): by group, from, to
//! - `lb_orchestrator_leader` (gauge): 1 while this node leads
//! - `lb_orchestrator_assigned_backends` (gauge): size of this worker's shard
//! - `lb_config_swaps_total` / `lb_config_rejections_total` (counter) by group
//! - `lb_store_errors_total` (counter): by operation
//! - `lb_vip_owner` (gauge): 1 while this node holds the shared address
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op (tests, embedded use)

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint started"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to start metrics endpoint"),
    }
}

pub fn record_selection(group: &str, algorithm: &str) {
    metrics::counter!("lb_selections_total", "group" => group.to_string(), "algorithm" => algorithm.to_string())
        .increment(1);
}

pub fn record_pool_empty(group: &str) {
    metrics::counter!("lb_pool_empty_total", "group" => group.to_string()).increment(1);
}

pub fn record_active_connections(group: &str, backend: &str, active: usize) {
    metrics::gauge!("lb_backend_active_connections", "group" => group.to_string(), "backend" => backend.to_string())
        .set(active as f64);
}

pub fn record_probe(group: &str, outcome: &'static str, duration: Duration) {
    metrics::counter!("lb_probes_total", "group" => group.to_string(), "outcome" => outcome).increment(1);
    metrics::histogram!("lb_probe_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_health_transition(group: &str, from: &str, to: &str) {
    metrics::counter!(
        "lb_health_transitions_total",
        "group" => group.to_string(),
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

pub fn record_leadership(leading: bool) {
    metrics::gauge!("lb_orchestrator_leader").set(if leading { 1.0 } else { 0.0 });
}

pub fn record_assigned_backends(count: usize) {
    metrics::gauge!("lb_orchestrator_assigned_backends").set(count as f64);
}

pub fn record_config_swap(group: &str, version: u64) {
    metrics::counter!("lb_config_swaps_total", "group" => group.to_string()).increment(1);
    metrics::gauge!("lb_config_version", "group" => group.to_string()).set(version as f64);
}

pub fn record_config_rejection(group: &str) {
    metrics::counter!("lb_config_rejections_total", "group" => group.to_string()).increment(1);
}

pub fn record_store_error(operation: &'static str) {
    metrics::counter!("lb_store_errors_total", "operation" => operation).increment(1);
}

pub fn record_vip_owner(owner: bool) {
    metrics::gauge!("lb_vip_owner").set(if owner { 1.0 } else { 0.0 });
}
