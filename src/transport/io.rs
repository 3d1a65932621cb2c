//! Endpoint abstraction for the forwarding loop
//!
//! The forwarder waits on `readable`/`writable` and then services each
//! endpoint with [`try_send`]/[`try_recv`], which poll the endpoint's
//! `send`/`recv` exactly once and report what happened instead of waiting.

use super::TransportError;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::io;
use tokio::net::{TcpStream, UdpSocket, UnixDatagram};

/// A packet endpoint: a TUN/TAP descriptor or a transport socket
#[async_trait]
pub trait PacketIo: Send + Sync {
    /// Wait until a read would make progress
    async fn readable(&self) -> io::Result<()>;

    /// Wait until a write would make progress
    async fn writable(&self) -> io::Result<()>;

    /// Read one chunk (a datagram, a frame, or stream bytes)
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one chunk, returning how much was taken
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Short name for logs
    fn label(&self) -> &'static str;
}

/// Result of a non-blocking write
#[derive(Debug)]
pub enum WriteOutcome {
    /// Everything was written
    Complete,
    /// Only the first `n` bytes were written
    Partial(usize),
    /// Nothing was written; try again next tick
    WouldBlock,
    /// The endpoint failed
    Fatal(io::Error),
}

/// Result of a non-blocking read
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes were read; zero means end of stream or an empty datagram
    Data(usize),
    /// Nothing to read right now
    WouldBlock,
    /// The endpoint failed
    Fatal(io::Error),
}

/// Errors that mean "try later"
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Errors a connected UDP socket reports because of ICMP noise
///
/// UDP cannot tell a stray "port unreachable" from a real fault, so these
/// are swallowed rather than treated as fatal.
pub fn is_udp_interference(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    ) {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(libc::EHOSTUNREACH | libc::ENETUNREACH | libc::EHOSTDOWN)
    )
}

/// Attempt one write without waiting
pub fn try_send(io: &dyn PacketIo, buf: &[u8]) -> WriteOutcome {
    match io.send(buf).now_or_never() {
        None => WriteOutcome::WouldBlock,
        Some(Ok(n)) if n >= buf.len() => WriteOutcome::Complete,
        Some(Ok(0)) => WriteOutcome::Fatal(io::Error::from(io::ErrorKind::WriteZero)),
        Some(Ok(n)) => WriteOutcome::Partial(n),
        Some(Err(e)) if is_transient(&e) => WriteOutcome::WouldBlock,
        Some(Err(e)) => WriteOutcome::Fatal(e),
    }
}

/// Attempt one read without waiting
pub fn try_recv(io: &dyn PacketIo, buf: &mut [u8]) -> ReadOutcome {
    match io.recv(buf).now_or_never() {
        None => ReadOutcome::WouldBlock,
        Some(Ok(n)) => ReadOutcome::Data(n),
        Some(Err(e)) if is_transient(&e) => ReadOutcome::WouldBlock,
        Some(Err(e)) => ReadOutcome::Fatal(e),
    }
}

/// Produces a replacement transport after a fatal transport error
#[async_trait]
pub trait Reconnect: Send {
    /// Tear down whatever is left and return a fresh, connected endpoint
    async fn reconnect(&mut self) -> Result<Box<dyn PacketIo>, TransportError>;
}

#[async_trait]
impl PacketIo for TcpStream {
    async fn readable(&self) -> io::Result<()> {
        TcpStream::readable(self).await
    }

    async fn writable(&self) -> io::Result<()> {
        TcpStream::writable(self).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            TcpStream::readable(self).await?;
            match self.try_read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                result => return result,
            }
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            TcpStream::writable(self).await?;
            match self.try_write(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                result => return result,
            }
        }
    }

    fn label(&self) -> &'static str {
        "tcp"
    }
}

#[async_trait]
impl PacketIo for UdpSocket {
    async fn readable(&self) -> io::Result<()> {
        UdpSocket::readable(self).await
    }

    async fn writable(&self) -> io::Result<()> {
        UdpSocket::writable(self).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf).await
    }

    fn label(&self) -> &'static str {
        "udp"
    }
}

#[async_trait]
impl PacketIo for UnixDatagram {
    async fn readable(&self) -> io::Result<()> {
        UnixDatagram::readable(self).await
    }

    async fn writable(&self) -> io::Result<()> {
        UnixDatagram::writable(self).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UnixDatagram::recv(self, buf).await
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UnixDatagram::send(self, buf).await
    }

    fn label(&self) -> &'static str {
        "unix"
    }
}
