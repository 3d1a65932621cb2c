//! Rendezvous settings and the establishment entry point

use super::{tcp_establish, udp_establish, Backoff, PacketIo, Reconnect, TransportError};
use crate::control::ControlFlags;
use crate::protocol::{HAND_TIMEOUT, HEARTBEAT_INTERVAL};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Which transport carries the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Tcp,
    Udp,
}

impl TransportMode {
    pub fn is_udp(&self) -> bool {
        matches!(self, TransportMode::Udp)
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Tcp => write!(f, "tcp"),
            TransportMode::Udp => write!(f, "udp"),
        }
    }
}

/// Rendezvous configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Transport to establish
    pub mode: TransportMode,
    /// Local address to bind (UDP) or listen on (TCP)
    pub local: SocketAddr,
    /// Peer address
    pub peer: SocketAddr,
    /// UDP bind/connect attempts
    pub bind_attempts: u32,
    /// TCP racing rounds
    pub tcp_rounds: u32,
    /// Listen and connect attempts within one TCP round
    pub race_attempts: u32,
    /// Linear backoff step in milliseconds
    pub backoff_base_ms: u64,
    /// Backoff ceiling in milliseconds
    pub backoff_cap_ms: u64,
    /// Single TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// How long the listening leg waits for a connection in one round
    pub accept_window_ms: u64,
    /// Granularity at which the listening leg checks its stop flag
    pub accept_poll_ms: u64,
    /// Time the peer has to send its hand, in milliseconds
    pub hand_timeout_ms: u64,
    /// UDP heartbeat period in milliseconds
    pub heartbeat_interval_ms: u64,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Tcp,
            local: SocketAddr::from(([0, 0, 0, 0], 7000)),
            peer: SocketAddr::from(([127, 0, 0, 1], 7000)),
            bind_attempts: 30,
            tcp_rounds: 50,
            race_attempts: 10,
            backoff_base_ms: 100,
            backoff_cap_ms: 2000,
            connect_timeout_ms: 3000,
            accept_window_ms: 5000,
            accept_poll_ms: 250,
            hand_timeout_ms: HAND_TIMEOUT.as_millis() as u64,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL.as_millis() as u64,
        }
    }
}

impl RendezvousConfig {
    /// Create a config for `local`/`peer` with default tunables
    pub fn new(mode: TransportMode, local: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            mode,
            local,
            peer,
            ..Self::default()
        }
    }

    /// Backoff for UDP bind and connect
    pub fn bind_backoff(&self) -> Backoff {
        Backoff::new(self.bind_attempts, self.backoff_base(), self.backoff_cap())
    }

    /// Backoff for each leg of a TCP round
    pub fn race_backoff(&self) -> Backoff {
        Backoff::new(self.race_attempts, self.backoff_base(), self.backoff_cap())
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn accept_window(&self) -> Duration {
        Duration::from_millis(self.accept_window_ms)
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms.max(1))
    }

    pub fn hand_timeout(&self) -> Duration {
        Duration::from_millis(self.hand_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

/// Establish the configured transport
pub async fn establish(
    config: &RendezvousConfig,
    flags: &ControlFlags,
) -> Result<Box<dyn PacketIo>, TransportError> {
    info!(
        "Establishing {} transport {} <-> {}",
        config.mode, config.local, config.peer
    );

    match config.mode {
        TransportMode::Udp => Ok(Box::new(udp_establish(config, flags).await?)),
        TransportMode::Tcp => Ok(Box::new(tcp_establish(config, flags).await?)),
    }
}

/// Reconnect hook that re-runs the rendezvous
pub struct RendezvousReconnect {
    config: RendezvousConfig,
    flags: ControlFlags,
}

impl RendezvousReconnect {
    pub fn new(config: RendezvousConfig, flags: ControlFlags) -> Self {
        Self { config, flags }
    }
}

#[async_trait]
impl Reconnect for RendezvousReconnect {
    async fn reconnect(&mut self) -> Result<Box<dyn PacketIo>, TransportError> {
        info!("Re-establishing transport with {}", self.config.peer);
        establish(&self.config, &self.flags).await
    }
}
