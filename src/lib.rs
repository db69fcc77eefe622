//! Control plane for a fleet of L7 load balancers.
//!
//! # Architecture Overview
//!
//! ```text
//!   admin (publisher, drain)
//!        │ /lb-configs/<group>            /health/<group>/<backend>
//!        ▼                                        ▲
//!   ┌──────────────────────── store ─────────────────────────┐
//!   │  sessions · ephemeral entries · CAS · one-shot watches  │
//!   └───────▲──────────────────▲───────────────────▲──────────┘
//!           │                  │                   │
//!   ┌───────┴───────┐  ┌───────┴────────┐  ┌───────┴────────┐
//!   │  orchestrator │  │     cache      │  │   discovery    │
//!   │ election      │  │ snapshot swap  │  │ registry       │
//!   │ supervisor    │  │      │         │  │ resolver       │
//!   │ worker→health │  │      ▼         │  │ vip failover   │
//!   └───────────────┘  │ load_balancer  │  └────────────────┘
//!                      │ RR / WRR / LC  │
//!                      └────────────────┘
//!
//!   cross-cutting: config · observability · resilience · lifecycle · http
//! ```

// Coordination
pub mod store;

// Core subsystems
pub mod cache;
pub mod config;
pub mod discovery;
pub mod health;
pub mod load_balancer;
pub mod orchestrator;

// Surfaces
pub mod admin;
pub mod http;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::NodeConfig;
pub use lifecycle::{Node, Shutdown};
pub use load_balancer::RoutingEngine;
pub use store::{CoordinationStore, StoreHandle};
