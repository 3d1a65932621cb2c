//! TUN/TAP descriptor endpoint
//!
//! The descriptor is opened and configured by the caller; this only puts it
//! in non-blocking mode and registers it with the reactor. Every read yields
//! one frame and every write takes one frame.

use super::PacketIo;
use async_trait::async_trait;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use tokio::io::unix::AsyncFd;

/// An already-open TUN/TAP device
pub struct TunFd {
    inner: AsyncFd<File>,
}

impl TunFd {
    /// Wrap an open device file
    pub fn new(file: File) -> io::Result<Self> {
        set_nonblocking(file.as_raw_fd())?;
        Ok(Self {
            inner: AsyncFd::new(file)?,
        })
    }

    /// Take ownership of a raw descriptor
    ///
    /// # Safety
    /// `fd` must be an open descriptor not owned by anything else.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        // SAFETY: ownership is transferred by the caller
        let file = unsafe { File::from_raw_fd(fd) };
        Self::new(file)
    }
}

impl AsRawFd for TunFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    if !flags.contains(OFlag::O_NONBLOCK) {
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    }
    Ok(())
}

#[async_trait]
impl PacketIo for TunFd {
    async fn readable(&self) -> io::Result<()> {
        self.inner.readable().await.map(|_| ())
    }

    async fn writable(&self) -> io::Result<()> {
        self.inner.writable().await.map(|_| ())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(&mut *buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    fn label(&self) -> &'static str {
        "tun"
    }
}
