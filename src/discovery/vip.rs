//! Shared-address (VIP) failover.
//!
//! # Responsibilities
//! - Decide which discovery node owns the shared address
//! - Apply acquire/release through an [`AddressOwner`]
//!
//! # State Transitions
//! ```text
//! Backup → Owner: no better peer heard for `missed_threshold` intervals
//! Owner → Backup: a better peer announces itself as owner
//! ```
//! Better = higher priority, ties to the lower node id.
//!
//! # Design Decisions
//! - The state machine is pure; time is counted in heartbeat intervals
//! - A node waits `missed_threshold` intervals after start before claiming

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{broadcast, watch};
use tokio::time::{self, MissedTickBehavior};

use crate::discovery::heartbeat::HeartbeatChannel;
use crate::discovery::DiscoveryError;
use crate::observability::metrics;

/// Announcement sent every heartbeat interval.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub priority: u32,
    /// True while the sender holds the address.
    pub owner: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VipRole {
    Backup,
    Owner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VipAction {
    Acquire,
    Release,
}

#[derive(Debug, Clone)]
struct Peer {
    priority: u32,
    owner: bool,
    /// A heartbeat arrived during the current interval.
    heard: bool,
    /// Whole intervals that passed without a heartbeat.
    silent: u32,
}

/// Returns true if (priority_a, id_a) ranks above (priority_b, id_b).
fn outranks(priority_a: u32, id_a: &str, priority_b: u32, id_b: &str) -> bool {
    priority_a > priority_b || (priority_a == priority_b && id_a < id_b)
}

/// Priority election with hysteresis.
#[derive(Debug, Clone)]
pub struct VipStateMachine {
    node_id: String,
    priority: u32,
    missed_threshold: u32,
    role: VipRole,
    intervals_since_start: u32,
    peers: HashMap<String, Peer>,
}

impl VipStateMachine {
    pub fn new(node_id: impl Into<String>, priority: u32, missed_threshold: u32) -> Self {
        Self {
            node_id: node_id.into(),
            priority,
            missed_threshold: missed_threshold.max(1),
            role: VipRole::Backup,
            intervals_since_start: 0,
            peers: HashMap::new(),
        }
    }

    pub fn role(&self) -> VipRole {
        self.role
    }

    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            node_id: self.node_id.clone(),
            priority: self.priority,
            owner: self.role == VipRole::Owner,
        }
    }

    fn better_peer_alive(&self) -> bool {
        self.peers
            .iter()
            .any(|(id, p)| outranks(p.priority, id, self.priority, &self.node_id))
    }

    /// A heartbeat arrived from a peer.
    pub fn on_heartbeat(&mut self, hb: &Heartbeat) -> Option<VipAction> {
        if hb.node_id == self.node_id {
            return None;
        }
        self.peers.insert(
            hb.node_id.clone(),
            Peer {
                priority: hb.priority,
                owner: hb.owner,
                heard: true,
                silent: 0,
            },
        );

        let better = outranks(hb.priority, &hb.node_id, self.priority, &self.node_id);
        if self.role == VipRole::Owner && better && hb.owner {
            self.role = VipRole::Backup;
            return Some(VipAction::Release);
        }
        None
    }

    /// One heartbeat interval elapsed.
    pub fn on_interval(&mut self) -> Option<VipAction> {
        self.intervals_since_start = self.intervals_since_start.saturating_add(1);
        for peer in self.peers.values_mut() {
            if peer.heard {
                peer.heard = false;
            } else {
                peer.silent = peer.silent.saturating_add(1);
            }
        }
        let threshold = self.missed_threshold;
        self.peers.retain(|_, p| p.silent < threshold);

        if self.role == VipRole::Backup
            && self.intervals_since_start >= self.missed_threshold
            && !self.better_peer_alive()
        {
            self.role = VipRole::Owner;
            return Some(VipAction::Acquire);
        }
        None
    }

    /// Undo a claim whose acquire failed; it is retried next interval.
    pub fn demote(&mut self) {
        self.role = VipRole::Backup;
    }

    /// Id of the peer believed to own the address, if any.
    pub fn known_owner(&self) -> Option<&str> {
        if self.role == VipRole::Owner {
            return Some(self.node_id.as_str());
        }
        self.peers
            .iter()
            .find(|(_, p)| p.owner)
            .map(|(id, _)| id.as_str())
    }
}

/// Puts the shared address on / off this host.
#[async_trait]
pub trait AddressOwner: Send + Sync + 'static {
    async fn acquire(&self, address: &str) -> Result<(), DiscoveryError>;
    async fn release(&self, address: &str) -> Result<(), DiscoveryError>;
}

/// Runs configured commands (e.g. `ip addr add {address} dev eth0`).
#[derive(Debug, Clone, Default)]
pub struct CommandAddressOwner {
    acquire: Vec<String>,
    release: Vec<String>,
}

impl CommandAddressOwner {
    pub fn new(acquire: Vec<String>, release: Vec<String>) -> Self {
        Self { acquire, release }
    }

    async fn run(template: &[String], address: &str) -> Result<(), DiscoveryError> {
        let args: Vec<String> = template.iter().map(|a| a.replace("{address}", address)).collect();
        let Some((program, rest)) = args.split_first() else {
            tracing::debug!(address = %address, "No address command configured");
            return Ok(());
        };
        let status = Command::new(program).args(rest).status().await?;
        if status.success() {
            Ok(())
        } else {
            Err(DiscoveryError::Command(format!("{} exited with {}", program, status)))
        }
    }
}

#[async_trait]
impl AddressOwner for CommandAddressOwner {
    async fn acquire(&self, address: &str) -> Result<(), DiscoveryError> {
        Self::run(&self.acquire, address).await
    }

    async fn release(&self, address: &str) -> Result<(), DiscoveryError> {
        Self::run(&self.release, address).await
    }
}

/// Drives a [`VipStateMachine`] over a heartbeat channel.
pub struct VipManager {
    machine: VipStateMachine,
    address: String,
    interval: Duration,
    channel: Arc<dyn HeartbeatChannel>,
    owner: Arc<dyn AddressOwner>,
    role_tx: watch::Sender<VipRole>,
}

impl VipManager {
    pub fn new(
        machine: VipStateMachine,
        address: impl Into<String>,
        interval: Duration,
        channel: Arc<dyn HeartbeatChannel>,
        owner: Arc<dyn AddressOwner>,
    ) -> Self {
        let (role_tx, _) = watch::channel(VipRole::Backup);
        Self {
            machine,
            address: address.into(),
            interval,
            channel,
            owner,
            role_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<VipRole> {
        self.role_tx.subscribe()
    }

    async fn apply(&mut self, action: VipAction) {
        match action {
            VipAction::Acquire => match self.owner.acquire(&self.address).await {
                Ok(()) => {
                    tracing::info!(address = %self.address, "Shared address acquired");
                    metrics::record_vip_owner(true);
                }
                Err(e) => {
                    tracing::error!(address = %self.address, error = %e, "Failed to acquire shared address");
                    self.machine.demote();
                }
            },
            VipAction::Release => {
                if let Err(e) = self.owner.release(&self.address).await {
                    tracing::error!(address = %self.address, error = %e, "Failed to release shared address");
                }
                tracing::info!(address = %self.address, "Shared address released");
                metrics::record_vip_owner(false);
            }
        }
        self.role_tx.send_replace(self.machine.role());
    }

    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let channel = self.channel.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(action) = self.machine.on_interval() {
                        self.apply(action).await;
                    }
                    if let Err(e) = channel.send(&self.machine.heartbeat()).await {
                        tracing::debug!(error = %e, "Failed to send heartbeat");
                    }
                }
                received = channel.recv() => match received {
                    Ok(hb) => {
                        if let Some(action) = self.machine.on_heartbeat(&hb) {
                            self.apply(action).await;
                        }
                    }
                    Err(DiscoveryError::ChannelClosed) => {
                        tracing::warn!("Heartbeat channel closed");
                        break;
                    }
                    Err(e) => tracing::debug!(error = %e, "Discarding malformed heartbeat"),
                },
                _ = shutdown.recv() => {
                    if self.machine.role() == VipRole::Owner {
                        self.machine.demote();
                        self.apply(VipAction::Release).await;
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hb(id: &str, priority: u32, owner: bool) -> Heartbeat {
        Heartbeat {
            node_id: id.into(),
            priority,
            owner,
        }
    }

    #[test]
    fn test_waits_before_first_claim() {
        let mut m = VipStateMachine::new("a", 100, 3);
        assert_eq!(m.on_interval(), None);
        assert_eq!(m.on_interval(), None);
        assert_eq!(m.on_interval(), Some(VipAction::Acquire));
        assert_eq!(m.role(), VipRole::Owner);
    }

    #[test]
    fn test_backup_stays_while_owner_heard() {
        let mut backup = VipStateMachine::new("b", 50, 3);
        for _ in 0..10 {
            backup.on_heartbeat(&hb("a", 100, true));
            assert_eq!(backup.on_interval(), None);
        }
        assert_eq!(backup.known_owner(), Some("a"));
    }

    #[test]
    fn test_claims_after_missed_threshold() {
        let mut backup = VipStateMachine::new("b", 50, 3);
        for _ in 0..3 {
            backup.on_heartbeat(&hb("a", 100, true));
            backup.on_interval();
        }
        // Owner goes silent.
        assert_eq!(backup.on_interval(), None);
        assert_eq!(backup.on_interval(), None);
        assert_eq!(backup.on_interval(), Some(VipAction::Acquire));
    }

    #[test]
    fn test_threshold_one_holds_while_owner_heard() {
        let mut backup = VipStateMachine::new("b", 50, 1);
        for _ in 0..5 {
            backup.on_heartbeat(&hb("a", 100, true));
            assert_eq!(backup.on_interval(), None);
            assert_eq!(backup.role(), VipRole::Backup);
        }
        assert_eq!(backup.on_interval(), Some(VipAction::Acquire));
    }

    #[test]
    fn test_single_missed_heartbeat_does_not_flap() {
        let mut backup = VipStateMachine::new("b", 50, 3);
        for round in 0..20 {
            if round % 2 == 0 {
                backup.on_heartbeat(&hb("a", 100, true));
            }
            assert_eq!(backup.on_interval(), None);
        }
    }

    #[test]
    fn test_owner_yields_to_better_owner() {
        let mut m = VipStateMachine::new("b", 50, 1);
        assert_eq!(m.on_interval(), Some(VipAction::Acquire));

        // A better peer that is not yet owner does not cause a release.
        assert_eq!(m.on_heartbeat(&hb("a", 100, false)), None);
        assert_eq!(m.on_heartbeat(&hb("a", 100, true)), Some(VipAction::Release));
        assert_eq!(m.role(), VipRole::Backup);

        // A worse owner is ignored.
        let mut top = VipStateMachine::new("a", 100, 1);
        top.on_interval();
        assert_eq!(top.on_heartbeat(&hb("b", 50, true)), None);
        assert_eq!(top.role(), VipRole::Owner);
    }

    #[test]
    fn test_priority_tie_broken_by_id() {
        assert!(outranks(10, "a", 10, "b"));
        assert!(!outranks(10, "b", 10, "a"));
        assert!(outranks(11, "z", 10, "a"));
    }
}
