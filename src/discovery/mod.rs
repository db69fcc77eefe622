//! Discovery / failover subsystem.
//!
//! # Data Flow
//! ```text
//! LB node:       registry.rs → /lb-nodes/<id> (ephemeral)
//! orchestrator:  /health/<fleet_group>/<id> (optional filter)
//! discovery:     resolver.rs (watch + reconcile) → resolve(locality)
//!
//! discovery nodes among themselves:
//!     heartbeat.rs (UDP / in-process) ⇄ vip.rs state machine
//!     → AddressOwner acquire/release of the shared address
//! ```
//!
//! # Design Decisions
//! - Answers come from a local snapshot; the store is not on the query path
//! - Address ownership uses heartbeats, not the store, so it survives a
//!   store outage

pub mod heartbeat;
pub mod registry;
pub mod resolver;
pub mod vip;

pub use heartbeat::{HeartbeatChannel, InProcessHeartbeat, UdpHeartbeat};
pub use registry::{LbNodeRecord, NodeRegistration};
pub use resolver::{rank_nodes, ResolvedAddress, Resolver};
pub use vip::{AddressOwner, CommandAddressOwner, Heartbeat, VipManager, VipRole, VipStateMachine};

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("address command failed: {0}")]
    Command(String),

    #[error("heartbeat channel closed")]
    ChannelClosed,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
