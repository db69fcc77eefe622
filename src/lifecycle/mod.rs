//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Connect store → config cache → publisher → orchestrator
//!     → LB registration → discovery → API listener
//!
//! Shutdown (shutdown.rs):
//!     Signal received → every loop leaves its select! → sessions closed
//!     (ephemeral entries revoked) → exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     second signal  → exit immediately
//! ```
//!
//! # Design Decisions
//! - Ordered startup: store first, then state, then listeners
//! - Shutdown has a deadline: remaining tasks are aborted after it

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::{spawn_signal_handler, wait_for_signal};
pub use startup::{Node, StartupError};
