//! etcd v3 coordination store.
//!
//! # Mapping
//! - session → lease (`lease_grant` / `lease_keep_alive` / `lease_revoke`)
//! - create-if-absent → txn guarded by `version(key) == 0`
//! - compare-and-set → txn guarded by `mod_revision(key) == expected`
//! - `set` on an existing key uses `ignore_lease` so ephemeral entries keep their lease
//! - one-shot watch → first event of a watch stream, then cancel

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;

use super::{
    CoordinationStore, ExpectedVersion, Result, SessionId, StoreError, Version, Versioned, Watch,
    WatchEvent, WatchKind, WatchScope,
};

/// etcd-backed implementation of [`CoordinationStore`].
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish_non_exhaustive()
    }
}

impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        match e {
            etcd_client::Error::TransportError(_) => StoreError::Unavailable(e.to_string()),
            etcd_client::Error::LeaseKeepAliveError(_) => StoreError::SessionExpired,
            etcd_client::Error::GRpcStatus(ref status)
                if status.message().contains("lease not found") =>
            {
                StoreError::SessionExpired
            }
            etcd_client::Error::GRpcStatus(ref status)
                if matches!(
                    format!("{:?}", status.code()).as_str(),
                    "Unavailable" | "DeadlineExceeded"
                ) =>
            {
                StoreError::Unavailable(e.to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl EtcdStore {
    /// Connect to an etcd cluster.
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        tracing::info!(endpoints = ?endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    fn decode_kv(kv: &etcd_client::KeyValue) -> Result<(String, Versioned)> {
        let key = kv
            .key_str()
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .to_string();
        let value: Value = serde_json::from_slice(kv.value())?;
        Ok((
            key,
            Versioned {
                value,
                version: kv.mod_revision() as Version,
            },
        ))
    }

    /// Compare that encodes an expected version, or `None` for `Any`.
    fn guard(path: &str, expected: ExpectedVersion) -> Option<Compare> {
        match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Absent => Some(Compare::version(path, CompareOp::Equal, 0)),
            ExpectedVersion::Exactly(v) => {
                Some(Compare::mod_revision(path, CompareOp::Equal, v as i64))
            }
        }
    }

    async fn failed_guard(&self, path: &str, expected: ExpectedVersion) -> StoreError {
        match expected {
            ExpectedVersion::Absent => StoreError::NodeExists(path.to_string()),
            _ => match self.get(path).await {
                Ok(None) => StoreError::NotFound(path.to_string()),
                Ok(Some(_)) => StoreError::VersionConflict {
                    path: path.to_string(),
                },
                Err(e) => e,
            },
        }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn create_session(&self, ttl: Duration) -> Result<SessionId> {
        let mut client = self.client.clone();
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let lease = client.lease_grant(ttl_secs, None).await?;
        Ok(SessionId(lease.id()))
    }

    async fn keep_alive(&self, session: SessionId) -> Result<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(session.0).await?;
        keeper.keep_alive().await?;
        match stream.message().await? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => Err(StoreError::SessionExpired),
        }
    }

    async fn close_session(&self, session: SessionId) -> Result<()> {
        let mut client = self.client.clone();
        match client.lease_revoke(session.0).await {
            Ok(_) => Ok(()),
            Err(e) => match StoreError::from(e) {
                StoreError::SessionExpired => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn create_ephemeral(
        &self,
        path: &str,
        value: Value,
        session: SessionId,
    ) -> Result<Version> {
        let mut client = self.client.clone();
        let payload = serde_json::to_vec(&value)?;
        let txn = Txn::new()
            .when(vec![Compare::version(path, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                path,
                payload,
                Some(PutOptions::new().with_lease(session.0)),
            )]);
        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        Ok(resp.header().map(|h| h.revision() as Version).unwrap_or_default())
    }

    async fn get(&self, path: &str) -> Result<Option<Versioned>> {
        let mut client = self.client.clone();
        let resp = client.get(path, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(Self::decode_kv(kv)?.1)),
            None => Ok(None),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let mut client = self.client.clone();
        let base = format!("{}/", prefix.trim_end_matches('/'));
        let resp = client
            .get(base.as_str(), Some(GetOptions::new().with_prefix()))
            .await?;
        let mut out = resp
            .kvs()
            .iter()
            .map(Self::decode_kv)
            .collect::<Result<Vec<_>>>()?;
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn set(&self, path: &str, value: Value, expected: ExpectedVersion) -> Result<Version> {
        let mut client = self.client.clone();
        let payload = serde_json::to_vec(&value)?;
        let keep_lease = TxnOp::put(
            path,
            payload.clone(),
            Some(PutOptions::new().with_ignore_lease()),
        );
        let fresh = TxnOp::put(path, payload, None);

        let txn = match Self::guard(path, expected) {
            // An existing key keeps its lease; a missing one is created plain.
            None => Txn::new()
                .when(vec![Compare::version(path, CompareOp::Greater, 0)])
                .and_then(vec![keep_lease])
                .or_else(vec![fresh]),
            Some(cmp) => match expected {
                ExpectedVersion::Absent => Txn::new().when(vec![cmp]).and_then(vec![fresh]),
                _ => Txn::new().when(vec![cmp]).and_then(vec![keep_lease]),
            },
        };

        let resp = client.txn(txn).await?;
        if !resp.succeeded() && expected != ExpectedVersion::Any {
            return Err(self.failed_guard(path, expected).await);
        }
        Ok(resp.header().map(|h| h.revision() as Version).unwrap_or_default())
    }

    async fn delete(&self, path: &str, expected: ExpectedVersion) -> Result<()> {
        let mut client = self.client.clone();
        match Self::guard(path, expected) {
            None => {
                client.delete(path, None).await?;
                Ok(())
            }
            Some(cmp) => {
                let txn = Txn::new()
                    .when(vec![cmp])
                    .and_then(vec![TxnOp::delete(path, None)]);
                let resp = client.txn(txn).await?;
                if resp.succeeded() || expected == ExpectedVersion::Absent {
                    return Ok(());
                }
                Err(self.failed_guard(path, expected).await)
            }
        }
    }

    async fn watch(&self, path: &str, scope: WatchScope) -> Result<Watch> {
        let mut client = self.client.clone();
        let options = match scope {
            WatchScope::Key => None,
            WatchScope::Prefix => Some(WatchOptions::new().with_prefix()),
        };
        let key = match scope {
            WatchScope::Key => path.to_string(),
            WatchScope::Prefix => format!("{}/", path.trim_end_matches('/')),
        };
        let (mut watcher, mut stream) = client.watch(key.as_str(), options).await?;
        let (mut tx, rx) = oneshot::channel();

        let watched = path.to_string();
        tokio::spawn(async move {
            let event = loop {
                tokio::select! {
                    _ = tx.closed() => break None,
                    message = stream.message() => match message {
                        Ok(Some(resp)) => {
                            let first = resp.events().iter().find_map(|ev| {
                                let kv = ev.kv()?;
                                let path = kv.key_str().ok()?.to_string();
                                let kind = match ev.event_type() {
                                    EventType::Put => WatchKind::Put,
                                    EventType::Delete => WatchKind::Delete,
                                };
                                Some(WatchEvent { path, kind })
                            });
                            if first.is_some() {
                                break first;
                            }
                        }
                        Ok(None) => break None,
                        Err(e) => {
                            tracing::warn!(path = %watched, error = %e, "etcd watch stream failed");
                            break None;
                        }
                    },
                }
            };
            if let Some(event) = event {
                let _ = tx.send(event);
            }
            let _ = watcher.cancel().await;
        });

        Ok(Watch::new(path, rx))
    }
}
