//! The forwarding loop
//!
//! One task moves frames both ways between the TUN/TAP device and the
//! transport:
//! - TUN -> `FrameTransform::from_tun` -> encrypt -> frame -> forward queue -> transport
//! - transport -> backward queue -> unframe -> decrypt -> `FrameTransform::to_tun` -> TUN
//!
//! Each tick waits for readiness on whichever endpoints have work, then
//! services every endpoint with non-blocking reads and writes, at most
//! `batch` packets per endpoint per tick.

use super::{
    FrameTransform, Op, PacketFramer, PacketQueue, RateLimiter, Side, TunnelError, DEFAULT_BATCH,
    DEFAULT_HIGH_WATER, DEFAULT_LOW_WATER,
};
use crate::control::ControlFlags;
use crate::crypto::PacketCipher;
use crate::protocol::MAX_DATAGRAM;
use crate::transport::{
    is_udp_interference, try_recv, try_send, PacketIo, ReadOutcome, Reconnect, WriteOutcome,
};
use bytes::Bytes;
use std::io;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

/// Accept predicate applied to decoded frames; `false` drops the frame
pub type PacketFilter = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Forwarder settings
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// How frames look on the device
    pub transform: FrameTransform,
    /// How frames are delimited on the transport
    pub framer: PacketFramer,
    /// Transport write ceiling in bytes per second
    pub bandwidth: Option<u64>,
    /// Queue depth at which the queue's source stops being read
    pub high_water: usize,
    /// Queue depth at which reading resumes
    pub low_water: usize,
    /// Packets serviced per endpoint per tick
    pub batch: usize,
    /// Longest wait for readiness
    pub tick: Duration,
    /// Sleep between checks while suspended
    pub suspend_poll: Duration,
    /// Largest device frame forwarded; bigger ones are dropped
    pub mtu: usize,
}

impl ForwarderConfig {
    pub fn new(transform: FrameTransform, framer: PacketFramer) -> Self {
        Self {
            transform,
            framer,
            bandwidth: None,
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
            batch: DEFAULT_BATCH,
            tick: Duration::from_millis(100),
            suspend_poll: Duration::from_millis(100),
            mtu: MAX_DATAGRAM,
        }
    }
}

/// Counters kept by the forwarder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    /// Frames read from the device and queued for the peer
    pub frames_to_peer: u64,
    /// Bytes written to the transport (framing and padding included)
    pub bytes_sent: u64,
    /// Frames written to the device
    pub frames_from_peer: u64,
    /// Bytes read from the transport
    pub bytes_received: u64,
    /// Local frames rejected by the local filter
    pub filtered_local: u64,
    /// Peer frames rejected by the remote filter
    pub filtered_remote: u64,
    /// Peer packets that failed to decrypt
    pub undecryptable: u64,
    /// Local frames over the MTU or too large for the transport
    pub oversized: u64,
    /// Transport replacements
    pub reconnects: u64,
}

/// Which endpoints the next wait cares about
#[derive(Debug, Clone, Copy, Default)]
struct Interest {
    tun_read: bool,
    tun_write: bool,
    net_read: bool,
    net_write: bool,
}

/// Why the wait returned
enum Wake {
    Ready,
    Timeout,
    Failed(Side, io::Error),
}

impl Wake {
    fn from_result(side: Side, result: io::Result<()>) -> Self {
        match result {
            Ok(()) => Wake::Ready,
            Err(e) => Wake::Failed(side, e),
        }
    }
}

/// Bidirectional TUN <-> transport forwarder
pub struct Forwarder {
    config: ForwarderConfig,
    tun: Box<dyn PacketIo>,
    transport: Box<dyn PacketIo>,
    cipher: PacketCipher,
    flags: ControlFlags,
    reconnect: Option<Box<dyn Reconnect>>,
    accept_local: Option<PacketFilter>,
    accept_remote: Option<PacketFilter>,
    /// Encoded records waiting for the transport
    fwd: PacketQueue,
    /// Raw transport bytes waiting to become device frames
    bwd: PacketQueue,
    /// Device frame that could not be written yet
    pending_tun: Option<Bytes>,
    /// Head of `fwd` is the tail of a partially written record
    fwd_partial: bool,
    limiter: Option<RateLimiter>,
    stats: ForwardStats,
    tun_buf: Vec<u8>,
    net_buf: Vec<u8>,
}

impl Forwarder {
    /// Create a forwarder over an established transport
    pub fn new(
        config: ForwarderConfig,
        tun: Box<dyn PacketIo>,
        transport: Box<dyn PacketIo>,
        cipher: PacketCipher,
        flags: ControlFlags,
    ) -> Self {
        let fwd = PacketQueue::new(config.high_water, config.low_water);
        let bwd = PacketQueue::new(config.high_water, config.low_water);
        let limiter = config.bandwidth.map(RateLimiter::new);
        let tun_buf = vec![0u8; MAX_DATAGRAM];
        let net_buf = vec![0u8; MAX_DATAGRAM];

        Self {
            config,
            tun,
            transport,
            cipher,
            flags,
            reconnect: None,
            accept_local: None,
            accept_remote: None,
            fwd,
            bwd,
            pending_tun: None,
            fwd_partial: false,
            limiter,
            stats: ForwardStats::default(),
            tun_buf,
            net_buf,
        }
    }

    /// Replace the transport through `hook` instead of failing on transport errors
    pub fn with_reconnect(mut self, hook: Box<dyn Reconnect>) -> Self {
        self.reconnect = Some(hook);
        self
    }

    /// Filter frames read from the device
    pub fn with_local_filter(mut self, filter: PacketFilter) -> Self {
        self.accept_local = Some(filter);
        self
    }

    /// Filter frames received from the peer
    pub fn with_remote_filter(mut self, filter: PacketFilter) -> Self {
        self.accept_remote = Some(filter);
        self
    }

    /// Counters so far
    pub fn stats(&self) -> ForwardStats {
        self.stats
    }

    /// Forward until terminated
    ///
    /// Returns the final counters when termination was requested, and an
    /// error when an endpoint failed for good.
    pub async fn run(&mut self) -> Result<ForwardStats, TunnelError> {
        info!(
            "Forwarding {} <-> {} ({:?}, {:?}, cipher {})",
            self.tun.label(),
            self.transport.label(),
            self.config.transform,
            self.config.framer,
            self.cipher
                .kind()
                .map_or_else(|| "disabled".to_string(), |k| k.to_string()),
        );

        match self.forward().await {
            Ok(()) => Ok(self.stats),
            Err(e) if e.is_killed() => {
                info!("Forwarder killed during reconnect");
                Ok(self.stats)
            }
            Err(e) => {
                error!("Forwarder stopped: {}", e);
                Err(e)
            }
        }
    }

    async fn forward(&mut self) -> Result<(), TunnelError> {
        loop {
            if self.flags.is_terminated() {
                info!("Termination requested, stopping forwarder");
                return Ok(());
            }

            if self.flags.is_suspended() {
                sleep(self.config.suspend_poll).await;
                continue;
            }

            let interest = match self.interest() {
                Ok(interest) => interest,
                Err(TunnelError::InvalidRecord(reason)) => {
                    self.desynced(reason).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let timeout = self.wait_timeout();
            match wait(self.tun.as_ref(), self.transport.as_ref(), interest, timeout).await {
                Wake::Ready | Wake::Timeout => {}
                Wake::Failed(_, e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Wake::Failed(side, e) => {
                    if self.flags.is_suspended() {
                        debug!("Ignoring {} wait error while suspended: {}", side, e);
                        continue;
                    }
                    match side {
                        Side::Transport => {
                            self.transport_fault(Op::Wait, e).await?;
                            continue;
                        }
                        Side::Tun => return Err(TunnelError::fatal(Side::Tun, Op::Wait, e)),
                    }
                }
            }

            if let Some(e) = self.flush_transport() {
                self.transport_fault(Op::Write, e).await?;
                continue;
            }
            match self.flush_tun() {
                Ok(()) => {}
                Err(TunnelError::InvalidRecord(reason)) => {
                    self.desynced(reason).await?;
                    continue;
                }
                Err(e) => return Err(e),
            }
            self.drain_tun()?;
            if let Some(e) = self.drain_transport() {
                self.transport_fault(Op::Read, e).await?;
            }
        }
    }

    fn interest(&mut self) -> Result<Interest, TunnelError> {
        let budget = self.limiter.as_ref().map_or(true, RateLimiter::has_budget);
        let inbound_ready = self.config.framer.packet_ready(&mut self.bwd)?;

        Ok(Interest {
            tun_read: self.fwd.accepts_more(),
            tun_write: self.pending_tun.is_some() || inbound_ready,
            // An incomplete head record can only be finished by reading more
            net_read: self.bwd.accepts_more() || !inbound_ready,
            net_write: !self.fwd.is_empty() && budget,
        })
    }

    fn wait_timeout(&self) -> Duration {
        match &self.limiter {
            Some(limiter) if !limiter.has_budget() && !self.fwd.is_empty() => self
                .config
                .tick
                .min(limiter.time_until_budget())
                .max(Duration::from_millis(1)),
            _ => self.config.tick,
        }
    }

    /// Write queued records to the transport; returns a transport fault
    fn flush_transport(&mut self) -> Option<io::Error> {
        for _ in 0..self.config.batch {
            let Some(record) = self.fwd.pop_front() else {
                break;
            };
            if let Some(limiter) = self.limiter.as_mut() {
                if !limiter.acquire(record.len()) {
                    self.fwd.push_front(record);
                    break;
                }
            }

            match try_send(self.transport.as_ref(), &record) {
                WriteOutcome::Complete => {
                    self.fwd_partial = false;
                    self.record_sent(record.len());
                }
                WriteOutcome::Partial(n) => {
                    self.fwd_partial = true;
                    self.record_sent(n);
                    self.fwd.push_front(record.slice(n..));
                    break;
                }
                WriteOutcome::WouldBlock => {
                    self.fwd.push_front(record);
                    break;
                }
                WriteOutcome::Fatal(e) => {
                    self.fwd.push_front(record);
                    if self.is_datagram() && is_udp_interference(&e) {
                        debug!("Ignoring UDP send error: {}", e);
                        break;
                    }
                    return Some(e);
                }
            }
        }
        None
    }

    fn record_sent(&mut self, bytes: usize) {
        self.stats.bytes_sent += bytes as u64;
        if let Some(limiter) = self.limiter.as_mut() {
            limiter.consume(bytes);
        }
    }

    /// Write peer frames to the device
    fn flush_tun(&mut self) -> Result<(), TunnelError> {
        for _ in 0..self.config.batch {
            let frame = match self.pending_tun.take() {
                Some(frame) => frame,
                None => match self.next_inbound()? {
                    Some(frame) => frame,
                    None => break,
                },
            };

            match try_send(self.tun.as_ref(), &frame) {
                WriteOutcome::Complete => self.stats.frames_from_peer += 1,
                WriteOutcome::Partial(n) => {
                    warn!("Device took {} of {} bytes", n, frame.len());
                    self.stats.frames_from_peer += 1;
                }
                WriteOutcome::WouldBlock => {
                    self.pending_tun = Some(frame);
                    break;
                }
                WriteOutcome::Fatal(e) => {
                    return Err(TunnelError::fatal(Side::Tun, Op::Write, e));
                }
            }
        }
        Ok(())
    }

    /// Next peer frame in device format, skipping dropped ones
    fn next_inbound(&mut self) -> Result<Option<Bytes>, TunnelError> {
        while let Some(body) = self.config.framer.pull_packet(&mut self.bwd)? {
            let frame = match self.cipher.decrypt(body) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping peer packet: {}", e);
                    self.stats.undecryptable += 1;
                    continue;
                }
            };
            if frame.is_empty() {
                continue;
            }

            if let Some(accept) = &self.accept_remote {
                if !accept(&frame) {
                    self.stats.filtered_remote += 1;
                    trace!("Filtered peer frame: {}", self.config.transform.describe(&frame));
                    continue;
                }
            }

            trace!("peer -> tun: {}", self.config.transform.describe(&frame));
            return Ok(Some(self.config.transform.to_tun(frame)));
        }
        Ok(None)
    }

    /// Read device frames into the forward queue
    fn drain_tun(&mut self) -> Result<(), TunnelError> {
        for _ in 0..self.config.batch {
            if !self.fwd.accepts_more() {
                break;
            }

            let n = match try_recv(self.tun.as_ref(), &mut self.tun_buf) {
                ReadOutcome::Data(0) | ReadOutcome::WouldBlock => break,
                ReadOutcome::Data(n) => n,
                ReadOutcome::Fatal(e) => return Err(TunnelError::fatal(Side::Tun, Op::Read, e)),
            };

            if n > self.config.mtu {
                warn!("Dropping {} byte local frame over the {} byte MTU", n, self.config.mtu);
                self.stats.oversized += 1;
                continue;
            }

            let raw = Bytes::copy_from_slice(&self.tun_buf[..n]);
            let frame = self.config.transform.from_tun(raw);
            if frame.is_empty() {
                continue;
            }

            if let Some(accept) = &self.accept_local {
                if !accept(&frame) {
                    self.stats.filtered_local += 1;
                    trace!("Filtered local frame: {}", self.config.transform.describe(&frame));
                    continue;
                }
            }

            trace!("tun -> peer: {}", self.config.transform.describe(&frame));
            match self.config.framer.encode(self.cipher.encrypt(frame)) {
                Ok(record) => {
                    self.fwd.push_back(record);
                    self.stats.frames_to_peer += 1;
                }
                Err(e) => {
                    warn!("Dropping local frame: {}", e);
                    self.stats.oversized += 1;
                }
            }
        }
        Ok(())
    }

    /// Read transport bytes into the backward queue; returns a transport fault
    fn drain_transport(&mut self) -> Option<io::Error> {
        for _ in 0..self.config.batch {
            // Framing errors surface on the next interest check
            if !self.bwd.accepts_more()
                && self.config.framer.packet_ready(&mut self.bwd).unwrap_or(true)
            {
                break;
            }

            match try_recv(self.transport.as_ref(), &mut self.net_buf) {
                // Heartbeat
                ReadOutcome::Data(0) if self.is_datagram() => continue,
                ReadOutcome::Data(0) => {
                    return Some(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ));
                }
                ReadOutcome::Data(n) => {
                    self.stats.bytes_received += n as u64;
                    self.bwd.push_back(Bytes::copy_from_slice(&self.net_buf[..n]));
                }
                ReadOutcome::WouldBlock => break,
                ReadOutcome::Fatal(e) if self.is_datagram() && is_udp_interference(&e) => {
                    debug!("Ignoring UDP receive error: {}", e);
                    break;
                }
                ReadOutcome::Fatal(e) => return Some(e),
            }
        }
        None
    }

    fn is_datagram(&self) -> bool {
        self.config.framer == PacketFramer::Datagram
    }

    /// The peer stream no longer lines up with record boundaries
    async fn desynced(&mut self, reason: String) -> Result<(), TunnelError> {
        let lost = self.bwd.take_all();
        warn!("Peer stream out of sync ({}), dropping {} bytes", reason, lost.len());
        self.transport_fault(
            Op::Read,
            io::Error::new(io::ErrorKind::InvalidData, format!("invalid record: {}", reason)),
        )
        .await
    }

    /// Swap in a new transport, or fail if there is no reconnect hook
    async fn transport_fault(&mut self, op: Op, err: io::Error) -> Result<(), TunnelError> {
        let Some(hook) = self.reconnect.as_mut() else {
            return Err(TunnelError::fatal(Side::Transport, op, err));
        };

        warn!("Transport {} failed: {}; reconnecting", op, err);
        self.transport = hook.reconnect().await?;
        self.stats.reconnects += 1;

        if self.config.framer == PacketFramer::Stream {
            if self.fwd_partial {
                if let Some(rest) = self.fwd.pop_front() {
                    warn!("Dropped {} unsent bytes of a partially written record", rest.len());
                }
                self.fwd_partial = false;
            }
            let dropped = self.config.framer.discard_partial(&mut self.bwd)?;
            if dropped > 0 {
                debug!("Dropped {} bytes of a partially received record", dropped);
            }
        }

        info!(
            "Transport replaced ({} reconnect(s), {} bytes still queued)",
            self.stats.reconnects,
            self.fwd.queued_bytes()
        );
        Ok(())
    }
}

/// Wait until an endpoint of interest is ready, or `timeout` passes
async fn wait(
    tun: &dyn PacketIo,
    transport: &dyn PacketIo,
    interest: Interest,
    timeout: Duration,
) -> Wake {
    tokio::select! {
        r = tun.readable(), if interest.tun_read => Wake::from_result(Side::Tun, r),
        r = tun.writable(), if interest.tun_write => Wake::from_result(Side::Tun, r),
        r = transport.readable(), if interest.net_read => Wake::from_result(Side::Transport, r),
        r = transport.writable(), if interest.net_write => Wake::from_result(Side::Transport, r),
        _ = sleep(timeout) => Wake::Timeout,
    }
}
