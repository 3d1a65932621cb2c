//! UDP rendezvous
//!
//! BINDING: bind the local address, retrying with backoff.
//! HANDSHAKING: connect to the peer, then exchange empty heartbeat
//! datagrams until one arrives from the peer.
//! ESTABLISHED: the connected socket is returned.

use super::{RendezvousConfig, TransportError};
use crate::control::ControlFlags;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

/// Bind, connect and handshake a UDP socket with the peer
pub async fn udp_establish(
    config: &RendezvousConfig,
    flags: &ControlFlags,
) -> Result<UdpSocket, TransportError> {
    let backoff = config.bind_backoff();

    let socket = backoff
        .retry("bind UDP socket", flags, None, |_| UdpSocket::bind(config.local))
        .await?;
    backoff
        .retry("connect UDP socket", flags, None, |_| socket.connect(config.peer))
        .await?;

    info!(
        "UDP socket {} connected to {}, waiting for peer",
        socket.local_addr()?,
        config.peer
    );

    let interval = config.heartbeat_interval();
    let socket = Arc::new(socket);
    let done = Arc::new(AtomicBool::new(false));
    let heartbeat = tokio::spawn(heartbeat(Arc::clone(&socket), Arc::clone(&done), interval));

    let result = wait_for_peer(&socket, interval, flags).await;
    done.store(true, Ordering::SeqCst);
    heartbeat
        .await
        .map_err(|e| TransportError::Task(e.to_string()))?;
    result?;

    let socket = Arc::try_unwrap(socket)
        .map_err(|_| TransportError::Task("heartbeat still holds the socket".to_string()))?;

    info!("UDP peer {} is up", config.peer);
    Ok(socket)
}

/// Send an empty datagram every `interval` until `done`, plus a last one
async fn heartbeat(socket: Arc<UdpSocket>, done: Arc<AtomicBool>, interval: Duration) {
    loop {
        if let Err(e) = socket.send(&[]).await {
            debug!("Heartbeat send failed: {}", e);
        }
        if done.load(Ordering::SeqCst) {
            break;
        }
        sleep(interval).await;
    }
}

/// Block until any datagram arrives from the peer
async fn wait_for_peer(
    socket: &UdpSocket,
    interval: Duration,
    flags: &ControlFlags,
) -> Result<(), TransportError> {
    let mut buf = [0u8; 64];
    loop {
        flags.check()?;
        match timeout(interval, socket.recv(&mut buf)).await {
            Ok(Ok(_)) => return Ok(()),
            // Refused until the peer binds
            Ok(Err(e)) => {
                debug!("Waiting for UDP peer: {}", e);
                sleep(interval / 10).await;
            }
            Err(_) => {}
        }
    }
}
