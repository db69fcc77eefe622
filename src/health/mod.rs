//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! orchestrator::worker probe tick
//!     → probe.rs (one bounded HTTP check)
//!     → state.rs (consecutive counters, thresholds)
//!     → transition? → CAS write /health/<group>/<backendId>
//!
//! admin drain
//!     → state.rs set_state(Draining)
//!     → worker re-sync observes it, probes stop affecting the record
//! ```
//!
//! # Design Decisions
//! - State transitions require consecutive successes/failures
//! - Only transitions are persisted, bounding write volume
//! - Health state is per (group, backend)

pub mod probe;
pub mod state;

pub use probe::{HealthProbe, HttpProbe, ProbeError};
pub use state::{BackendHealthRecord, BackendKey, HealthState, ProbeOutcome, Transition};

use std::collections::BTreeMap;

use crate::store::paths::{segments_under, HEALTH_PATH};
use crate::store::{CoordinationStore, Result, Version};

/// Read every health record in one list call.
///
/// Records that do not decode, or sit at an unexpected depth, are skipped.
pub async fn load_health(
    store: &dyn CoordinationStore,
) -> Result<BTreeMap<BackendKey, (BackendHealthRecord, Version)>> {
    let entries = store.list(HEALTH_PATH).await?;
    let mut records = BTreeMap::new();
    for (path, versioned) in entries {
        let segments = segments_under(HEALTH_PATH, &path);
        let [group, backend_id] = segments.as_slice() else {
            continue;
        };
        match versioned.decode::<BackendHealthRecord>() {
            Ok(record) => {
                records.insert(BackendKey::new(*group, *backend_id), (record, versioned.version));
            }
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Skipping undecodable health record");
            }
        }
    }
    Ok(records)
}
