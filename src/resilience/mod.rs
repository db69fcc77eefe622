//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Store call fails with Unavailable:
//!     → keep serving the last-known-good state
//!     → backoff.rs (exponential delay with jitter)
//!     → retry the full refresh/registration
//! ```
//!
//! # Design Decisions
//! - Every retry loop is bounded by its delay cap, not by attempt count
//! - Jitter spreads reconnect storms across a fleet

pub mod backoff;

pub use backoff::{calculate_backoff, Backoff};
