//! Tunnel layer - the forwarding data plane
//!
//! Provides:
//! - TUN/TAP frame codec (PI headers, Ethernet inspection)
//! - Packet framing over stream and datagram transports
//! - Bounded packet queues with back-pressure
//! - Bandwidth limiting
//! - The forwarding loop itself

mod forwarder;
mod frame;
mod framer;
mod queue;
mod throttle;

pub use forwarder::{ForwardStats, Forwarder, ForwarderConfig, PacketFilter};
pub use frame::{
    describe_frame, ether_proto, ethernet_strip, strip_pi, wrap_pi, FrameTransform,
};
pub use framer::PacketFramer;
pub use queue::PacketQueue;
pub use throttle::RateLimiter;

use crate::transport::TransportError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Which endpoint an I/O failure happened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The local TUN/TAP descriptor
    Tun,
    /// The socket to the remote peer
    Transport,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Tun => f.write_str("tun"),
            Side::Transport => f.write_str("transport"),
        }
    }
}

/// The operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Wait,
    Read,
    Write,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Wait => f.write_str("wait"),
            Op::Read => f.write_str("read"),
            Op::Write => f.write_str("write"),
        }
    }
}

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Record too large: {0} > {1}")]
    RecordTooLarge(usize, usize),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Fatal {side} {op} error: {source}")]
    Fatal {
        side: Side,
        op: Op,
        #[source]
        source: io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl TunnelError {
    pub(crate) fn fatal(side: Side, op: Op, source: io::Error) -> Self {
        TunnelError::Fatal { side, op, source }
    }

    /// True when the error is a requested shutdown rather than a fault
    pub fn is_killed(&self) -> bool {
        matches!(self, TunnelError::Transport(e) if e.is_killed())
    }
}

/// Default high-water mark per queue (256 KB)
pub const DEFAULT_HIGH_WATER: usize = 256 * 1024;

/// Default low-water ("hurry") mark per queue (64 KB)
pub const DEFAULT_LOW_WATER: usize = 64 * 1024;

/// Default number of packets serviced per descriptor per tick
pub const DEFAULT_BATCH: usize = 16;
