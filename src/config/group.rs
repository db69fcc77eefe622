//! Load-balancer group records.
//!
//! An `LbGroupConfig` is written by the admin side to `/lb-configs/<group>`
//! and consumed by the config cache (routing) and the orchestrator (probing).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Backend selection algorithm for a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionAlgorithm {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
}

impl fmt::Display for SelectionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SelectionAlgorithm::RoundRobin => "round_robin",
            SelectionAlgorithm::WeightedRoundRobin => "weighted_round_robin",
            SelectionAlgorithm::LeastConnections => "least_connections",
        };
        f.write_str(name)
    }
}

/// A backend server in a group.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackendRef {
    /// Unique within the group.
    pub id: String,

    /// `host:port` of the backend.
    pub address: String,

    /// Weight for weighted round robin (>= 1).
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Active health check settings for a group.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckSpec {
    /// Path to probe.
    pub path: String,

    /// Status code a healthy backend answers with.
    pub expected_status: u16,

    /// Probe interval in milliseconds.
    pub interval_ms: u64,

    /// Hard per-probe timeout in milliseconds.
    pub timeout_ms: u64,

    /// Consecutive failures before UNHEALTHY.
    pub failure_threshold: u32,

    /// Consecutive successes before HEALTHY.
    pub success_threshold: u32,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            expected_status: 200,
            interval_ms: 5_000,
            timeout_ms: 2_000,
            failure_threshold: 3,
            success_threshold: 2,
        }
    }
}

impl HealthCheckSpec {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Routing configuration of one group.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LbGroupConfig {
    pub name: String,

    /// Ordered; the order is the stable selection order.
    pub backends: Vec<BackendRef>,

    #[serde(default)]
    pub health_check: HealthCheckSpec,

    #[serde(default)]
    pub algorithm: SelectionAlgorithm,

    /// Monotonically increasing; assigned by the publisher.
    #[serde(default)]
    pub version: u64,
}

impl LbGroupConfig {
    pub fn backend(&self, id: &str) -> Option<&BackendRef> {
        self.backends.iter().find(|b| b.id == id)
    }

    /// True if everything except the version is the same.
    pub fn same_content(&self, other: &LbGroupConfig) -> bool {
        self.name == other.name
            && self.backends == other.backends
            && self.health_check == other.health_check
            && self.algorithm == other.algorithm
    }
}

/// File format read by the publisher.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GroupsFile {
    #[serde(default)]
    pub groups: Vec<GroupDefinition>,
}

/// A group as written by an operator, plus drain requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupDefinition {
    #[serde(flatten)]
    pub group: LbGroupConfig,

    /// Backend ids to hold in DRAINING.
    #[serde(default)]
    pub draining: Vec<String>,
}
