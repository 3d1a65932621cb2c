//! Transport layer
//!
//! Provides:
//! - The [`PacketIo`] endpoint trait the forwarder drives (TUN/TAP
//!   descriptors and sockets alike)
//! - Non-blocking write/read primitives with explicit outcomes
//! - Rendezvous: UDP heartbeat handshake and TCP listen/connect race
//! - Bounded retry with linear backoff

mod io;
mod rendezvous;
mod retry;
mod tcp;
mod tun;
mod udp;

pub use io::{is_transient, is_udp_interference, try_recv, try_send, PacketIo, ReadOutcome, Reconnect, WriteOutcome};
pub use rendezvous::{establish, RendezvousConfig, RendezvousReconnect, TransportMode};
pub use retry::Backoff;
pub use tcp::{generate_hand, hand_wins, tcp_establish, tcp_handshake, Hand, RaceRole};
pub use tun::TunFd;
pub use udp::udp_establish;

use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not {what} after {attempts} attempts")]
    EstablishFailed { what: &'static str, attempts: u32 },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,

    #[error("Abandoned: sibling attempt finished first")]
    Stopped,

    #[error("Killed: termination requested")]
    Killed,

    #[error("Task failed: {0}")]
    Task(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

impl TransportError {
    /// True when the error is a requested shutdown rather than a fault
    pub fn is_killed(&self) -> bool {
        matches!(self, TransportError::Killed)
    }
}
