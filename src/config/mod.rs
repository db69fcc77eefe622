//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! node.toml
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → NodeConfig (validated, immutable)
//!
//! groups.toml (admin side)
//!     → loader.rs + validation.rs per group
//!     → admin::publisher writes /lb-configs/<group>
//!     → watcher.rs re-runs the publisher on change
//! ```
//!
//! # Design Decisions
//! - Node config is immutable once loaded; changes require restart
//! - Group config is data in the coordination store, not process config
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod group;
pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use group::{BackendRef, GroupDefinition, GroupsFile, HealthCheckSpec, LbGroupConfig, SelectionAlgorithm};
pub use loader::{load_config, load_groups_file, ConfigError};
pub use schema::NodeConfig;
pub use validation::{validate_group, ValidationError};
