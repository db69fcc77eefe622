//! Heartbeat transports for shared-address failover.

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};

use crate::discovery::vip::Heartbeat;
use crate::discovery::DiscoveryError;

/// Carries heartbeats between discovery nodes.
#[async_trait]
pub trait HeartbeatChannel: Send + Sync + 'static {
    async fn send(&self, heartbeat: &Heartbeat) -> Result<(), DiscoveryError>;

    /// Next heartbeat from another node.
    async fn recv(&self) -> Result<Heartbeat, DiscoveryError>;
}

/// JSON datagrams sent to every configured peer.
#[derive(Debug)]
pub struct UdpHeartbeat {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
}

impl UdpHeartbeat {
    pub async fn bind(bind_address: &str, peers: &[String]) -> Result<Self, DiscoveryError> {
        let socket = UdpSocket::bind(bind_address).await?;
        let peers = peers
            .iter()
            .map(|p| {
                p.parse::<SocketAddr>()
                    .map_err(|e| DiscoveryError::InvalidAddress(format!("{}: {}", p, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        tracing::info!(bind = %bind_address, peers = peers.len(), "Heartbeat socket bound");
        Ok(Self { socket, peers })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl HeartbeatChannel for UdpHeartbeat {
    async fn send(&self, heartbeat: &Heartbeat) -> Result<(), DiscoveryError> {
        let payload = serde_json::to_vec(heartbeat)?;
        for peer in &self.peers {
            // One unreachable peer must not starve the others.
            if let Err(e) = self.socket.send_to(&payload, peer).await {
                tracing::debug!(peer = %peer, error = %e, "Heartbeat send failed");
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Heartbeat, DiscoveryError> {
        let mut buf = [0u8; 1024];
        let (len, _) = self.socket.recv_from(&mut buf).await?;
        Ok(serde_json::from_slice(&buf[..len])?)
    }
}

/// In-process bus; every member sees every other member's heartbeats.
#[derive(Debug)]
pub struct InProcessHeartbeat {
    node_id: String,
    tx: broadcast::Sender<Heartbeat>,
    rx: Mutex<broadcast::Receiver<Heartbeat>>,
}

impl InProcessHeartbeat {
    /// A new bus to `join`.
    pub fn bus() -> broadcast::Sender<Heartbeat> {
        broadcast::channel(64).0
    }

    pub fn join(bus: &broadcast::Sender<Heartbeat>, node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            tx: bus.clone(),
            rx: Mutex::new(bus.subscribe()),
        }
    }
}

#[async_trait]
impl HeartbeatChannel for InProcessHeartbeat {
    async fn send(&self, heartbeat: &Heartbeat) -> Result<(), DiscoveryError> {
        let _ = self.tx.send(heartbeat.clone());
        Ok(())
    }

    async fn recv(&self) -> Result<Heartbeat, DiscoveryError> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(hb) if hb.node_id == self.node_id => continue,
                Ok(hb) => return Ok(hb),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(DiscoveryError::ChannelClosed),
            }
        }
    }
}
