//! Config cache subsystem.
//!
//! # Data Flow
//! ```text
//! /lb-configs/* and /health/* (coordination store)
//!     → config_cache.rs (watch → list → validate → re-watch, plus reconcile tick)
//!     → snapshot.rs (GroupSnapshot per group, RoutingTable of all groups)
//!     → ArcSwap<RoutingTable> read by the routing engine and the worker
//! ```
//!
//! # Design Decisions
//! - Copy-on-write: a new config version builds a new snapshot
//! - Lost notifications are covered by the reconcile tick
//! - Store outages degrade to serving the last-known-good table

pub mod config_cache;
pub mod snapshot;

pub use config_cache::{ConfigCache, RefreshSummary, Rejection};
pub use snapshot::{GroupSnapshot, RoutingTable};
