//! # tunbridge
//!
//! A userspace packet bridge between a TUN/TAP device and a remote peer
//! reachable over TCP or UDP, possibly behind NAT.
//!
//! ## Features
//!
//! - **Bidirectional forwarding** driven by a single readiness loop
//! - **Frame boundary recovery** over stream transports
//! - **Per-packet block encryption** (AES, Blowfish, DES, 3DES)
//! - **Bandwidth cap** as a byte quota
//! - **NAT rendezvous**: UDP heartbeat handshake, TCP listen/connect race
//! - **Reconnect hook** that keeps queued packets across transport swaps
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   forward queue    ┌──────────────┐
//! │              │ ─────────────────► │              │
//! │  TUN / TAP   │                    │  TCP / UDP   │ ◄──► peer
//! │  descriptor  │ ◄───────────────── │  transport   │
//! └──────────────┘   backward queue   └──────────────┘
//!        ▲                                   ▲
//!        │ FrameTransform                    │ PacketCipher + PacketFramer
//!        └──────────── Forwarder ────────────┘
//!                          ▲
//!                          │ connected socket
//!                 rendezvous (udp / tcp race)
//! ```

pub mod config;
pub mod control;
pub mod crypto;
pub mod protocol;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use control::ControlFlags;
pub use tunnel::{Forwarder, ForwarderConfig, ForwardStats};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True when the error is a requested shutdown rather than a fault
    pub fn is_killed(&self) -> bool {
        match self {
            Error::Transport(e) => e.is_killed(),
            Error::Tunnel(e) => e.is_killed(),
            _ => false,
        }
    }
}
