//! Group publisher.
//!
//! # Responsibilities
//! - Write each group of a groups file to `/lb-configs/<group>`
//! - Bump the version only when the content changed
//! - Delete groups that left the file
//! - Apply the `draining` lists to health records
//!
//! # Design Decisions
//! - A group that fails validation is skipped, its published version stays
//! - A newly created group starts at `max(file version, 1)`; re-creating a
//!   deleted group should carry a version above the deleted one

use std::collections::HashSet;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::admin::{set_draining, AdminError};
use crate::config::group::{GroupsFile, LbGroupConfig};
use crate::config::loader::load_groups_file;
use crate::config::schema::StoreConfig;
use crate::config::validation::validate_group;
use crate::config::watcher::GroupsFileWatcher;
use crate::health::{load_health, HealthState};
use crate::resilience::Backoff;
use crate::store::paths::{group_config_path, leaf, LB_CONFIGS_PATH};
use crate::store::{update_json, CoordinationStore, ExpectedVersion, StoreError, StoreHandle};

/// Outcome of one publish pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Groups written with a new version.
    pub published: Vec<String>,
    pub unchanged: usize,
    /// Groups that failed validation and were left alone.
    pub skipped: Vec<String>,
    pub removed: Vec<String>,
    pub drained: usize,
    pub undrained: usize,
}

pub struct Publisher {
    store: StoreHandle,
    retry: StoreConfig,
}

impl Publisher {
    pub fn new(store: StoreHandle, retry: &StoreConfig) -> Self {
        Self {
            store,
            retry: retry.clone(),
        }
    }

    /// Bring the store in line with `file`.
    pub async fn publish(&self, file: &GroupsFile) -> Result<PublishReport, AdminError> {
        let store = self.store.as_ref();
        let max_attempts = self.retry.cas_max_attempts;
        let mut report = PublishReport::default();
        let mut names = HashSet::new();

        for def in &file.groups {
            names.insert(def.group.name.clone());
            if let Err(errors) = validate_group(&def.group) {
                for e in &errors {
                    tracing::warn!(group = %def.group.name, error = %e, "Group failed validation, not publishing");
                }
                report.skipped.push(def.group.name.clone());
                continue;
            }

            let desired = &def.group;
            let written = update_json::<LbGroupConfig, _>(
                store,
                &group_config_path(&desired.name),
                max_attempts,
                |current| match current {
                    Some(current) if current.same_content(desired) => None,
                    Some(current) => Some(LbGroupConfig {
                        version: current.version + 1,
                        ..desired.clone()
                    }),
                    None => Some(LbGroupConfig {
                        version: desired.version.max(1),
                        ..desired.clone()
                    }),
                },
            )
            .await?;

            if written.is_some() {
                tracing::info!(group = %desired.name, "Group published");
                report.published.push(desired.name.clone());
            } else {
                report.unchanged += 1;
            }
        }

        for (path, versioned) in store.list(LB_CONFIGS_PATH).await? {
            let name = leaf(&path);
            if names.contains(name) {
                continue;
            }
            match store.delete(&path, ExpectedVersion::Exactly(versioned.version)).await {
                Ok(()) => {
                    tracing::info!(group = %name, "Group removed");
                    report.removed.push(name.to_string());
                }
                Err(StoreError::VersionConflict { .. }) | Err(StoreError::NotFound(_)) => {
                    tracing::debug!(group = %name, "Group changed concurrently, skipping removal");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let health = load_health(store).await?;
        for def in &file.groups {
            if report.skipped.contains(&def.group.name) {
                continue;
            }
            let draining: HashSet<&str> = def.draining.iter().map(String::as_str).collect();
            for backend in &def.group.backends {
                let current = health
                    .iter()
                    .find(|(key, _)| key.group == def.group.name && key.backend_id == backend.id)
                    .map(|(_, (record, _))| record.state);
                let want = draining.contains(backend.id.as_str());
                let is = current == Some(HealthState::Draining);
                if want == is {
                    continue;
                }
                if set_draining(store, &def.group.name, &backend.id, want, max_attempts)
                    .await?
                    .is_some()
                {
                    if want {
                        report.drained += 1;
                    } else {
                        report.undrained += 1;
                    }
                }
            }
        }

        tracing::info!(
            published = report.published.len(),
            unchanged = report.unchanged,
            removed = report.removed.len(),
            drained = report.drained,
            undrained = report.undrained,
            "Groups file applied"
        );
        Ok(report)
    }

    /// Publish, retrying while the store is unavailable.
    async fn publish_with_retry(&self, file: &GroupsFile, shutdown: &mut broadcast::Receiver<()>) {
        let mut backoff = Backoff::for_store(&self.retry);
        loop {
            match self.publish(file).await {
                Ok(_) => return,
                Err(AdminError::Store(e)) if e.is_retryable() => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, attempt = backoff.attempt(), delay = ?delay, "Publish failed, retrying");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.recv() => return,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Publish failed");
                    return;
                }
            }
        }
    }

    /// Publish `path` once, then again on every change if `watch` is set.
    pub async fn run(&self, path: PathBuf, watch: bool, mut shutdown: broadcast::Receiver<()>) {
        match load_groups_file(&path) {
            Ok(file) => self.publish_with_retry(&file, &mut shutdown).await,
            Err(e) => tracing::error!(path = ?path, error = %e, "Failed to load groups file"),
        }
        if !watch {
            return;
        }

        let (watcher, mut updates) = GroupsFileWatcher::new(&path);
        let _watcher = match watcher.run() {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(path = ?path, error = %e, "Failed to watch groups file");
                return;
            }
        };

        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Some(file) => self.publish_with_retry(&file, &mut shutdown).await,
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse_groups;
    use crate::store::{get_json, MemoryStore};
    use std::sync::Arc;

    const FILE: &str = r#"
        [[groups]]
        name = "api"
        draining = ["b2"]

        [[groups.backends]]
        id = "b1"
        address = "10.0.0.1:80"

        [[groups.backends]]
        id = "b2"
        address = "10.0.0.2:80"

        [[groups]]
        name = "web"

        [[groups.backends]]
        id = "w1"
        address = "10.0.1.1:80"
    "#;

    fn publisher() -> (MemoryStore, Publisher) {
        let store = MemoryStore::new();
        let publisher = Publisher::new(Arc::new(store.clone()), &StoreConfig::default());
        (store, publisher)
    }

    async fn version(store: &MemoryStore, group: &str) -> Option<u64> {
        get_json::<LbGroupConfig>(store, &group_config_path(group))
            .await
            .unwrap()
            .map(|(g, _)| g.version)
    }

    #[tokio::test]
    async fn test_versions_bump_only_on_change() {
        let (store, publisher) = publisher();
        let mut file = parse_groups(FILE).unwrap();

        let report = publisher.publish(&file).await.unwrap();
        assert_eq!(report.published, vec!["api".to_string(), "web".to_string()]);
        assert_eq!(report.drained, 1);
        assert_eq!(version(&store, "api").await, Some(1));

        let report = publisher.publish(&file).await.unwrap();
        assert!(report.published.is_empty());
        assert_eq!(report.unchanged, 2);
        assert_eq!(report.drained, 0);

        file.groups[0].group.backends[0].weight = 4;
        publisher.publish(&file).await.unwrap();
        assert_eq!(version(&store, "api").await, Some(2));
        assert_eq!(version(&store, "web").await, Some(1));
    }

    #[tokio::test]
    async fn test_removed_group_and_undrain() {
        let (store, publisher) = publisher();
        let mut file = parse_groups(FILE).unwrap();
        publisher.publish(&file).await.unwrap();

        file.groups.retain(|d| d.group.name == "api");
        file.groups[0].draining.clear();
        let report = publisher.publish(&file).await.unwrap();

        assert_eq!(report.removed, vec!["web".to_string()]);
        assert_eq!(report.undrained, 1);
        assert_eq!(version(&store, "web").await, None);

        let health = load_health(&store).await.unwrap();
        let (record, _) = &health[&crate::health::BackendKey::new("api", "b2")];
        assert_eq!(record.state, HealthState::Unknown);
    }

    #[tokio::test]
    async fn test_invalid_group_keeps_published_version() {
        let (store, publisher) = publisher();
        let mut file = parse_groups(FILE).unwrap();
        publisher.publish(&file).await.unwrap();

        file.groups[1].group.backends[0].weight = 0;
        let report = publisher.publish(&file).await.unwrap();
        assert_eq!(report.skipped, vec!["web".to_string()]);
        assert_eq!(version(&store, "web").await, Some(1));
    }
}
