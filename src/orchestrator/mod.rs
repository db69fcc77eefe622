//! Health orchestrator subsystem.
//!
//! # Data Flow
//! ```text
//! every orchestrator node:
//!     election.rs  → /orchestrator/leader (ephemeral, one owner)
//!     worker.rs    → /orchestrator/workers/<id> (ephemeral, carries the shard)
//!                  → probes its shard, writes /health/<group>/<backendId>
//!
//! leader only:
//!     supervisor.rs → watch workers + configs
//!                   → assignment.rs (consistent hash) → CAS each shard
//!                   → delete health of backends gone from config
//! ```
//!
//! # Design Decisions
//! - The partition is recomputed from scratch on every cycle (idempotent)
//! - Workers keep probing their last shard while there is no leader
//! - All coordination goes through the store; no direct node-to-node calls

pub mod assignment;
pub mod election;
pub mod supervisor;
pub mod worker;

pub use assignment::{compute_assignment, BackendKey, HashRing, WorkerRecord};
pub use election::{current_leader, LeaderElection, LeadershipState};
pub use supervisor::{ReconcileReport, Supervisor};
pub use worker::{Worker, WorkerStatus};

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The session behind leadership is gone; re-elect with a new session.
    #[error("leadership lost")]
    LeaderLost,

    /// The worker's own session expired; its registration is gone.
    #[error("worker session lost")]
    SessionLost,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
