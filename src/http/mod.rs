//! Status and discovery HTTP API.
//!
//! # Data Flow
//! ```text
//! GET /resolve?locality=  → discovery::Resolver snapshot
//! GET /status             → leadership, worker, VIP, routing table summary
//! GET /groups/{group}     → one group's backends with live counters
//! ```
//!
//! # Design Decisions
//! - Handlers only read local snapshots and watch channels; no store calls
//! - Roles not running on this node are reported as absent, not as errors

pub mod handlers;
pub mod server;

pub use handlers::{GroupDetail, GroupSummary, NodeStatus};
pub use server::{ApiServer, AppState};
