//! TCP rendezvous
//!
//! Neither peer knows which side should connect, so each round both peers
//! listen and connect at once. Every connection that comes up exchanges a
//! random 4-byte hand; a listener wins with the smaller hand and a
//! connector with the larger one, so both ends of one connection agree on
//! whether it is the one to keep.
//!
//! ```text
//!  round:  hand = random()
//!          +-- listen leg ---> accept ---> handshake --+
//!          |                                           +--> pick
//!          +-- connect leg --> connect --> handshake --+
//! ```

use super::{RendezvousConfig, TransportError};
use crate::control::ControlFlags;
use crate::crypto::{random_bytes, CryptoError};
use crate::protocol::HAND_LEN;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

/// Rendezvous token
pub type Hand = [u8; HAND_LEN];

/// Which half of a round produced a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceRole {
    Listener,
    Connector,
}

impl fmt::Display for RaceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaceRole::Listener => write!(f, "listener"),
            RaceRole::Connector => write!(f, "connector"),
        }
    }
}

/// Fresh random hand
pub fn generate_hand() -> Result<Hand, CryptoError> {
    let mut hand = [0u8; HAND_LEN];
    random_bytes(&mut hand)?;
    Ok(hand)
}

/// Check if the local side keeps this connection
///
/// Hands compare as big-endian unsigned values. Equal hands never win.
pub fn hand_wins(role: RaceRole, local: &Hand, peer: &Hand) -> bool {
    match role {
        RaceRole::Listener => local < peer,
        RaceRole::Connector => local > peer,
    }
}

/// Send our hand and read the peer's
pub async fn tcp_handshake(
    stream: &mut TcpStream,
    hand: &Hand,
    hand_timeout: Duration,
) -> Result<Hand, TransportError> {
    stream.write_all(hand).await?;

    let mut peer = [0u8; HAND_LEN];
    match timeout(hand_timeout, stream.read_exact(&mut peer)).await {
        Ok(Ok(_)) => Ok(peer),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TransportError::Closed),
        Ok(Err(e)) => Err(TransportError::Handshake(e.to_string())),
        Err(_) => Err(TransportError::Timeout),
    }
}

/// Race listen and connect against the peer until one connection is agreed on
pub async fn tcp_establish(
    config: &RendezvousConfig,
    flags: &ControlFlags,
) -> Result<TcpStream, TransportError> {
    let config = Arc::new(config.clone());

    for round in 1..=config.tcp_rounds {
        flags.check()?;

        let hand = generate_hand()?;
        let stop = Arc::new(AtomicBool::new(false));
        debug!(
            "Rendezvous round {}/{} with hand {:02x?}",
            round, config.tcp_rounds, hand
        );

        let listen = tokio::spawn(listen_leg(
            Arc::clone(&config),
            flags.clone(),
            Arc::clone(&stop),
            hand,
        ));
        let connect = tokio::spawn(connect_leg(
            Arc::clone(&config),
            flags.clone(),
            Arc::clone(&stop),
            hand,
        ));

        let (listened, connected) = tokio::join!(listen, connect);
        let listened = listened.map_err(|e| TransportError::Task(e.to_string()))?;
        let connected = connected.map_err(|e| TransportError::Task(e.to_string()))?;
        flags.check()?;

        if let Some(stream) = pick_leg(listened, connected) {
            stream.set_nodelay(true)?;
            info!(
                "TCP connection established with {} after {} round(s)",
                stream.peer_addr()?,
                round
            );
            return Ok(stream);
        }

        debug!("Rendezvous round {} produced no connection", round);
    }

    Err(TransportError::EstablishFailed {
        what: "establish TCP connection",
        attempts: config.tcp_rounds,
    })
}

/// End-of-round choice between the two legs
///
/// A lone connection is used as is; with two, the handshake winner is
/// used; a tie or nothing means another round.
fn pick_leg<T>(listened: Option<(T, bool)>, connected: Option<(T, bool)>) -> Option<T> {
    match (listened, connected) {
        (Some((stream, _)), None) | (None, Some((stream, _))) => Some(stream),
        (Some((stream, true)), Some(_)) => Some(stream),
        (Some(_), Some((stream, true))) => Some(stream),
        _ => None,
    }
}

async fn listen_leg(
    config: Arc<RendezvousConfig>,
    flags: ControlFlags,
    stop: Arc<AtomicBool>,
    hand: Hand,
) -> Option<(TcpStream, bool)> {
    let listener = config
        .race_backoff()
        .retry("listen for peer", &flags, Some(&stop), |_| bind_listener(&config))
        .await;
    let listener = match listener {
        Ok(listener) => listener,
        Err(e) => {
            debug!("Listen leg gave up: {}", e);
            return None;
        }
    };

    let stream = accept_until_stopped(&listener, &config, &flags, &stop).await?;
    finish_leg(stream, RaceRole::Listener, hand, config.hand_timeout(), &stop).await
}

async fn bind_listener(config: &RendezvousConfig) -> io::Result<TcpListener> {
    let socket = if config.local.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(config.local)?;
    socket.listen(1)
}

async fn accept_until_stopped(
    listener: &TcpListener,
    config: &RendezvousConfig,
    flags: &ControlFlags,
    stop: &AtomicBool,
) -> Option<TcpStream> {
    let deadline = Instant::now() + config.accept_window();

    loop {
        if flags.is_terminated() || stop.load(Ordering::SeqCst) {
            return None;
        }

        let now = Instant::now();
        if now >= deadline {
            debug!("No inbound connection within {:?}", config.accept_window());
            return None;
        }

        let slice = config.accept_poll().min(deadline - now);
        match timeout(slice, listener.accept()).await {
            Ok(Ok((stream, addr))) => {
                debug!("Accepted rendezvous connection from {}", addr);
                return Some(stream);
            }
            Ok(Err(e)) => {
                debug!("Accept failed: {}", e);
                sleep(slice).await;
            }
            Err(_) => {}
        }
    }
}

async fn connect_leg(
    config: Arc<RendezvousConfig>,
    flags: ControlFlags,
    stop: Arc<AtomicBool>,
    hand: Hand,
) -> Option<(TcpStream, bool)> {
    let connect_timeout = config.connect_timeout();
    let stream = config
        .race_backoff()
        .retry("connect to peer", &flags, Some(&stop), |_| async {
            timeout(connect_timeout, TcpStream::connect(config.peer))
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
        })
        .await;

    match stream {
        Ok(stream) => finish_leg(stream, RaceRole::Connector, hand, config.hand_timeout(), &stop).await,
        Err(e) => {
            debug!("Connect leg gave up: {}", e);
            None
        }
    }
}

/// Handshake a leg's connection and publish a win through `stop`
async fn finish_leg(
    mut stream: TcpStream,
    role: RaceRole,
    hand: Hand,
    hand_timeout: Duration,
    stop: &AtomicBool,
) -> Option<(TcpStream, bool)> {
    match tcp_handshake(&mut stream, &hand, hand_timeout).await {
        Ok(peer) => {
            let won = hand_wins(role, &hand, &peer);
            if won {
                stop.store(true, Ordering::SeqCst);
            }
            debug!(
                "{} handshake: ours {:02x?}, peer {:02x?}, {}",
                role,
                hand,
                peer,
                if won { "won" } else { "lost" }
            );
            Some((stream, won))
        }
        Err(e) => {
            debug!("{} handshake failed: {}", role, e);
            None
        }
    }
}
