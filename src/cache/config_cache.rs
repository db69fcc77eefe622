//! Per-node configuration cache.
//!
//! # Responsibilities
//! - Keep an atomic, immutable routing table for this node
//! - Refresh it from `/lb-configs` and `/health` on watch or reconcile tick
//! - Reject malformed records, keeping the previous valid version
//! - Keep serving the last-known-good table while the store is unreachable
//!
//! # Design Decisions
//! - Watches are armed before the read, so a change between read and
//!   re-arm still fires
//! - A group is rebuilt only when its config version increases; health
//!   changes are pushed into the existing snapshot

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::cache::snapshot::{GroupSnapshot, RoutingTable};
use crate::config::group::LbGroupConfig;
use crate::config::schema::StoreConfig;
use crate::config::validation::validate_group;
use crate::health::{load_health, HealthState};
use crate::observability::metrics;
use crate::resilience::Backoff;
use crate::store::paths::{segments_under, LB_CONFIGS_PATH, HEALTH_PATH};
use crate::store::{wait_event, StoreError, StoreHandle, Version, Versioned, WatchScope};

/// A group record that failed validation.
#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub group: String,
    pub store_version: Version,
    pub errors: Vec<String>,
}

/// What one refresh changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub groups: usize,
    pub rebuilt: Vec<String>,
    pub removed: Vec<String>,
    pub rejected: Vec<String>,
    pub health_changes: usize,
}

/// Routing configuration snapshot of one load-balancer node.
#[derive(Debug)]
pub struct ConfigCache {
    store: StoreHandle,
    table: ArcSwap<RoutingTable>,
    rejections: DashMap<String, Rejection>,
    reconcile_interval: Duration,
    retry_base_ms: u64,
    retry_max_ms: u64,
}

impl ConfigCache {
    pub fn new(store: StoreHandle, reconcile_interval: Duration, retry: &StoreConfig) -> Self {
        Self {
            store,
            table: ArcSwap::from_pointee(RoutingTable::default()),
            rejections: DashMap::new(),
            reconcile_interval,
            retry_base_ms: retry.retry_base_delay_ms,
            retry_max_ms: retry.retry_max_delay_ms,
        }
    }

    /// The current table. Readers never observe a partial update.
    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    pub fn group(&self, name: &str) -> Option<Arc<GroupSnapshot>> {
        self.table.load().group(name).cloned()
    }

    /// Outstanding rejections, sorted by group.
    pub fn rejections(&self) -> Vec<Rejection> {
        let mut out: Vec<Rejection> = self.rejections.iter().map(|r| r.value().clone()).collect();
        out.sort_by(|a, b| a.group.cmp(&b.group));
        out
    }

    /// Read configs and health once and swap in the new table.
    pub async fn refresh(&self) -> Result<RefreshSummary, StoreError> {
        let configs = self.store.list(LB_CONFIGS_PATH).await?;
        let health = load_health(self.store.as_ref()).await?;

        let mut health_by_group: HashMap<String, HashMap<String, HealthState>> = HashMap::new();
        for (key, (record, _)) in health {
            health_by_group
                .entry(key.group)
                .or_default()
                .insert(key.backend_id, record.state);
        }

        let current = self.table.load_full();
        let mut next: HashMap<String, Arc<GroupSnapshot>> = HashMap::new();
        let mut summary = RefreshSummary::default();

        for (path, versioned) in configs {
            let segments = segments_under(LB_CONFIGS_PATH, &path);
            let [name] = segments.as_slice() else {
                continue;
            };
            let name = name.to_string();
            let group_health = health_by_group.get(&name);
            let previous = current.group(&name);

            let config = match decode_group(&name, &versioned) {
                Ok(config) => {
                    self.rejections.remove(&name);
                    config
                }
                Err(errors) => {
                    tracing::warn!(
                        group = %name,
                        store_version = versioned.version,
                        errors = ?errors,
                        "Rejected group config, keeping previous version"
                    );
                    metrics::record_config_rejection(&name);
                    self.rejections.insert(
                        name.clone(),
                        Rejection {
                            group: name.clone(),
                            store_version: versioned.version,
                            errors,
                        },
                    );
                    summary.rejected.push(name.clone());
                    if let Some(previous) = previous {
                        summary.health_changes += previous.apply_health(group_health);
                        next.insert(name, previous.clone());
                    }
                    continue;
                }
            };

            match previous {
                Some(previous) if config.version <= previous.version() => {
                    if config.version < previous.version() {
                        tracing::warn!(
                            group = %name,
                            stored = config.version,
                            applied = previous.version(),
                            "Ignoring older group config version"
                        );
                    }
                    summary.health_changes += previous.apply_health(group_health);
                    next.insert(name, previous.clone());
                }
                _ => {
                    tracing::info!(
                        group = %name,
                        version = config.version,
                        backends = config.backends.len(),
                        algorithm = %config.algorithm,
                        "Applying group config"
                    );
                    metrics::record_config_swap(&name, config.version);
                    let snapshot = GroupSnapshot::build(config, versioned.version, group_health);
                    summary.rebuilt.push(name.clone());
                    next.insert(name, Arc::new(snapshot));
                }
            }
        }

        for name in current.names() {
            if !next.contains_key(&name) && !summary.rejected.contains(&name) {
                tracing::info!(group = %name, "Group removed");
                self.rejections.remove(&name);
                summary.removed.push(name);
            }
        }
        // A rejected group that is no longer in the store at all is forgotten.
        self.rejections.retain(|name, _| next.contains_key(name) || summary.rejected.contains(name));

        summary.groups = next.len();
        if !summary.rebuilt.is_empty() || !summary.removed.is_empty() {
            self.table.store(Arc::new(RoutingTable::new(next)));
        }
        Ok(summary)
    }

    /// Watch / refresh / re-watch until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = Backoff::new(self.retry_base_ms, self.retry_max_ms);
        tracing::info!(
            reconcile_ms = self.reconcile_interval.as_millis() as u64,
            "Config cache starting"
        );

        loop {
            let config_watch = self.store.watch(LB_CONFIGS_PATH, WatchScope::Prefix).await;
            let health_watch = self.store.watch(HEALTH_PATH, WatchScope::Prefix).await;
            let armed = config_watch.is_ok() && health_watch.is_ok();

            let delay = match self.refresh().await {
                Ok(summary) if armed => {
                    backoff.reset();
                    if !summary.rebuilt.is_empty() || !summary.removed.is_empty() {
                        tracing::debug!(?summary, "Config cache refreshed");
                    }
                    self.reconcile_interval
                }
                Ok(_) => {
                    tracing::warn!("Failed to arm config watches, polling");
                    backoff.next_delay()
                }
                Err(e) => {
                    metrics::record_store_error("cache_refresh");
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Config refresh failed, serving last-known-good table"
                    );
                    delay
                }
            };

            tokio::select! {
                event = wait_event(config_watch.ok()) => {
                    tracing::debug!(%event, "Group config changed");
                }
                event = wait_event(health_watch.ok()) => {
                    tracing::trace!(%event, "Health changed");
                }
                _ = sleep(delay) => {}
                _ = shutdown.recv() => {
                    tracing::info!("Config cache received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

/// Decode and validate the record stored for `name`.
pub(crate) fn decode_group(name: &str, versioned: &Versioned) -> Result<LbGroupConfig, Vec<String>> {
    let config: LbGroupConfig = versioned.decode().map_err(|e| vec![e.to_string()])?;
    if config.name != name {
        return Err(vec![format!("record name {:?} does not match path", config.name)]);
    }
    validate_group(&config).map_err(|errors| errors.iter().map(ToString::to_string).collect::<Vec<_>>())?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::group::{BackendRef, HealthCheckSpec, SelectionAlgorithm};
    use crate::health::BackendHealthRecord;
    use crate::store::paths::{backend_health_path, group_config_path};
    use crate::store::{CoordinationStore, ExpectedVersion, MemoryStore};
    use serde_json::json;

    fn group(version: u64, backends: &[&str]) -> LbGroupConfig {
        LbGroupConfig {
            name: "api".into(),
            backends: backends
                .iter()
                .enumerate()
                .map(|(i, id)| BackendRef {
                    id: id.to_string(),
                    address: format!("10.0.0.{}:80", i + 1),
                    weight: 1,
                })
                .collect(),
            health_check: HealthCheckSpec::default(),
            algorithm: SelectionAlgorithm::RoundRobin,
            version,
        }
    }

    async fn put_group(store: &MemoryStore, config: &LbGroupConfig) {
        store
            .set(&group_config_path(&config.name), serde_json::to_value(config).unwrap(), ExpectedVersion::Any)
            .await
            .unwrap();
    }

    async fn put_health(store: &MemoryStore, id: &str, state: HealthState) {
        let mut record = BackendHealthRecord::new("api", id);
        record.state = state;
        store
            .set(&backend_health_path("api", id), serde_json::to_value(&record).unwrap(), ExpectedVersion::Any)
            .await
            .unwrap();
    }

    fn cache(store: &MemoryStore) -> ConfigCache {
        ConfigCache::new(Arc::new(store.clone()), Duration::from_secs(30), &StoreConfig::default())
    }

    #[tokio::test]
    async fn test_refresh_builds_and_updates_health() {
        let store = MemoryStore::new();
        put_group(&store, &group(1, &["b1", "b2"])).await;
        put_health(&store, "b1", HealthState::Healthy).await;
        let cache = cache(&store);

        let summary = cache.refresh().await.unwrap();
        assert_eq!(summary.rebuilt, vec!["api".to_string()]);
        let before = cache.group("api").unwrap();
        assert_eq!(before.eligible().len(), 1);

        put_health(&store, "b2", HealthState::Healthy).await;
        let summary = cache.refresh().await.unwrap();
        assert!(summary.rebuilt.is_empty());
        assert_eq!(summary.health_changes, 1);
        // Same snapshot object, health pushed in place.
        assert!(Arc::ptr_eq(&before, &cache.group("api").unwrap()));
        assert_eq!(before.eligible().len(), 2);
    }

    #[tokio::test]
    async fn test_never_regresses() {
        let store = MemoryStore::new();
        put_group(&store, &group(5, &["b1"])).await;
        let cache = cache(&store);
        cache.refresh().await.unwrap();

        put_group(&store, &group(4, &["b1", "b2"])).await;
        cache.refresh().await.unwrap();
        assert_eq!(cache.group("api").unwrap().version(), 5);

        put_group(&store, &group(6, &["b1", "b2"])).await;
        cache.refresh().await.unwrap();
        assert_eq!(cache.group("api").unwrap().backends().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_record_keeps_previous() {
        let store = MemoryStore::new();
        put_group(&store, &group(1, &["b1"])).await;
        let cache = cache(&store);
        cache.refresh().await.unwrap();

        let mut bad = group(2, &["b1", "b1"]);
        bad.backends[1].weight = 0;
        put_group(&store, &bad).await;
        let summary = cache.refresh().await.unwrap();
        assert_eq!(summary.rejected, vec!["api".to_string()]);
        assert_eq!(cache.group("api").unwrap().version(), 1);
        assert_eq!(cache.rejections().len(), 1);

        store
            .set(&group_config_path("api"), json!({"garbage": true}), ExpectedVersion::Any)
            .await
            .unwrap();
        cache.refresh().await.unwrap();
        assert_eq!(cache.group("api").unwrap().version(), 1);

        put_group(&store, &group(3, &["b1"])).await;
        cache.refresh().await.unwrap();
        assert_eq!(cache.group("api").unwrap().version(), 3);
        assert!(cache.rejections().is_empty());
    }

    #[tokio::test]
    async fn test_serves_last_known_good_when_unavailable() {
        let store = MemoryStore::new();
        put_group(&store, &group(1, &["b1"])).await;
        let cache = cache(&store);
        cache.refresh().await.unwrap();

        store.set_available(false);
        assert!(matches!(cache.refresh().await, Err(StoreError::Unavailable(_))));
        assert!(cache.group("api").is_some());
    }

    #[tokio::test]
    async fn test_removed_group() {
        let store = MemoryStore::new();
        put_group(&store, &group(1, &["b1"])).await;
        let cache = cache(&store);
        cache.refresh().await.unwrap();

        store.delete(&group_config_path("api"), ExpectedVersion::Any).await.unwrap();
        let summary = cache.refresh().await.unwrap();
        assert_eq!(summary.removed, vec!["api".to_string()]);
        assert!(cache.group("api").is_none());
    }
}
