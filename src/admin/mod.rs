//! Admin side: publishing group records and draining backends.
//!
//! # Data Flow
//! ```text
//! groups.toml
//!     → config::loader (parse + validate)
//!     → publisher.rs → CAS /lb-configs/<group> (version + 1 on change)
//!                    → delete groups no longer in the file
//!                    → drain.rs per `draining` list
//! config::watcher (notify) → publisher.rs again
//! ```
//!
//! # Design Decisions
//! - The publisher is the only writer of group versions
//! - Unchanged groups are not rewritten, so caches do not rebuild
//! - Drain is a health-record state, not a group edit

pub mod drain;
pub mod publisher;

pub use drain::set_draining;
pub use publisher::{PublishReport, Publisher};

use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("group {0} is not published")]
    UnknownGroup(String),

    #[error("backend {backend} is not part of group {group}")]
    UnknownBackend { group: String, backend: String },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
