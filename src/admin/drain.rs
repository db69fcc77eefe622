//! Administrative drain / undrain of a backend.

use crate::admin::AdminError;
use crate::config::group::LbGroupConfig;
use crate::health::state::now_millis;
use crate::health::{BackendHealthRecord, HealthState, Transition};
use crate::store::paths::{backend_health_path, group_config_path};
use crate::store::{get_json, update_json, CoordinationStore};

/// Put a backend into DRAINING, or take it out again.
///
/// Undrain sets UNKNOWN; the owning worker's probes decide from there.
/// Returns the transition that was written, if any.
pub async fn set_draining(
    store: &dyn CoordinationStore,
    group: &str,
    backend_id: &str,
    draining: bool,
    max_attempts: u32,
) -> Result<Option<Transition>, AdminError> {
    let Some((config, _)) = get_json::<LbGroupConfig>(store, &group_config_path(group)).await?
    else {
        return Err(AdminError::UnknownGroup(group.to_string()));
    };
    if config.backend(backend_id).is_none() {
        return Err(AdminError::UnknownBackend {
            group: group.to_string(),
            backend: backend_id.to_string(),
        });
    }

    let path = backend_health_path(group, backend_id);
    let mut transition = None;
    update_json::<BackendHealthRecord, _>(store, &path, max_attempts, |current| {
        transition = None;
        let mut record = match current {
            Some(record) => record,
            None if draining => BackendHealthRecord::new(group, backend_id),
            None => return None,
        };
        let target = if draining {
            HealthState::Draining
        } else if record.state == HealthState::Draining {
            HealthState::Unknown
        } else {
            return None;
        };
        transition = record.set_state(target, now_millis());
        transition.map(|_| record)
    })
    .await?;

    if let Some(t) = transition {
        tracing::info!(group = %group, backend = %backend_id, from = %t.from, to = %t.to, "Drain state changed");
    }
    Ok(transition)
}
