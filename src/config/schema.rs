//! Node configuration schema.
//!
//! One TOML file configures every role a process may run. All sections have
//! defaults so a minimal file only names what differs.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for a control-plane process.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity of this process.
    pub node: NodeIdentity,

    /// Coordination store connection.
    pub store: StoreConfig,

    /// Load-balancer node role (config cache + routing engine).
    pub load_balancer: LoadBalancerConfig,

    /// Health orchestrator role (election, assignment, probing).
    pub orchestrator: OrchestratorConfig,

    /// Discovery role (fleet resolution, shared address).
    pub discovery: DiscoveryConfig,

    /// Status / discovery HTTP API.
    pub api: ApiConfig,

    /// Group definitions published from a local file.
    pub publisher: PublisherConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Process identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeIdentity {
    /// Unique node id; a random UUID when not configured.
    pub id: String,

    /// Locality label (zone, region) used by discovery.
    pub locality: Option<String>,
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            locality: None,
        }
    }
}

/// Which coordination store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; every role must run in this process.
    Memory,
    /// etcd v3 cluster.
    Etcd,
}

/// Coordination store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// etcd endpoints (e.g., "http://127.0.0.1:2379").
    pub endpoints: Vec<String>,

    /// Session TTL in milliseconds; the failover grace period.
    pub session_ttl_ms: u64,

    /// Session reaper interval for the memory backend.
    pub reap_interval_ms: u64,

    /// Attempts for a compare-and-set write before giving up.
    pub cas_max_attempts: u32,

    /// Base delay for retries while the store is unavailable.
    pub retry_base_delay_ms: u64,

    /// Maximum delay for retries while the store is unavailable.
    pub retry_max_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            session_ttl_ms: 10_000,
            reap_interval_ms: 200,
            cas_max_attempts: 5,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5_000,
        }
    }
}

/// Load-balancer node configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub enabled: bool,

    /// Address clients should use to reach this node (published to discovery).
    pub advertise_address: String,

    /// Relative weight of this node in discovery answers.
    pub weight: u32,

    /// Reconciliation poll interval, independent of watches.
    pub reconcile_interval_ms: u64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            advertise_address: "127.0.0.1:8080".to_string(),
            weight: 1,
            reconcile_interval_ms: 30_000,
        }
    }
}

/// Health orchestrator configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub enabled: bool,

    /// Cap on concurrent in-flight probes per worker.
    pub max_in_flight_probes: usize,

    /// How often a worker looks for due probes.
    pub probe_tick_ms: u64,

    /// Leader recomputes the partition at least this often.
    pub reassign_interval_ms: u64,

    /// Virtual nodes per worker on the hash ring.
    pub virtual_nodes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_in_flight_probes: 32,
            probe_tick_ms: 250,
            reassign_interval_ms: 15_000,
            virtual_nodes: 64,
        }
    }
}

/// Discovery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,

    /// If set, only LB nodes HEALTHY in this group's health records are returned.
    pub fleet_group: Option<String>,

    /// Maximum addresses per answer.
    pub max_results: usize,

    /// Reconciliation poll interval for the fleet snapshot.
    pub reconcile_interval_ms: u64,

    /// Shared address failover; disabled when absent.
    pub vip: Option<VipConfig>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fleet_group: None,
            max_results: 8,
            reconcile_interval_ms: 30_000,
            vip: None,
        }
    }
}

/// Shared address (VIP) failover configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VipConfig {
    /// The shared address (e.g., "10.0.0.100/24").
    pub address: String,

    /// Higher wins.
    pub priority: u32,

    /// UDP address heartbeats are received on.
    pub bind_address: String,

    /// Peer discovery nodes heartbeats are sent to.
    #[serde(default)]
    pub peers: Vec<String>,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Consecutive silent intervals before a backup claims the address.
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,

    /// Command run on acquire; `{address}` is substituted.
    #[serde(default)]
    pub acquire_command: Vec<String>,

    /// Command run on release; `{address}` is substituted.
    #[serde(default)]
    pub release_command: Vec<String>,
}

fn default_heartbeat_interval_ms() -> u64 {
    1_000
}

fn default_missed_heartbeats() -> u32 {
    3
}

/// Status / discovery HTTP API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:9000".to_string(),
        }
    }
}

/// Group publisher configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// TOML file with `[[groups]]` definitions.
    pub groups_file: Option<PathBuf>,

    /// Re-publish when the file changes.
    pub watch: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            groups_file: None,
            watch: true,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
