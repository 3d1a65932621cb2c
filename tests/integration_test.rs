//! Integration tests for tunbridge
//!
//! Drives whole bridges over loopback sockets, with a `UnixDatagram` pair
//! standing in for the TUN/TAP device:
//! - Plaintext UDP round trip
//! - Encrypted stream framing as seen on the wire
//! - Two bridges end to end after a TCP rendezvous
//! - Reconnect after a fatal transport write, datagram and stream
//! - TAP frames with packet-information headers

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket, UnixDatagram};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tunbridge::crypto::{CipherKind, PacketCipher};
use tunbridge::transport::{
    tcp_establish, udp_establish, PacketIo, Reconnect, RendezvousConfig, TransportError,
    TransportMode,
};
use tunbridge::tunnel::{FrameTransform, PacketFramer, TunnelError};
use tunbridge::{ControlFlags, ForwardStats, Forwarder, ForwarderConfig};

type Task = JoinHandle<Result<ForwardStats, TunnelError>>;

/// A minimal IPv4 header, 10.0.0.1 -> 10.0.0.`last`
fn ipv4_frame(last: u8) -> Vec<u8> {
    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    ip[3] = 20;
    ip[8] = 64;
    ip[9] = 17;
    ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
    ip[16..20].copy_from_slice(&[10, 0, 0, last]);
    ip
}

fn spawn_forwarder(
    transform: FrameTransform,
    framer: PacketFramer,
    transport: Box<dyn PacketIo>,
    cipher: PacketCipher,
    flags: &ControlFlags,
) -> (UnixDatagram, Task) {
    let (dev, app) = UnixDatagram::pair().unwrap();
    let mut config = ForwarderConfig::new(transform, framer);
    config.tick = Duration::from_millis(20);

    let mut forwarder = Forwarder::new(config, Box::new(dev), transport, cipher, flags.clone());
    let task = tokio::spawn(async move { forwarder.run().await });
    (app, task)
}

async fn recv_datagram(sock: &UnixDatagram) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    let n = timeout(Duration::from_secs(5), sock.recv(&mut buf))
        .await
        .expect("timed out waiting for a frame")
        .unwrap();
    buf.truncate(n);
    buf
}

/// Next non-empty datagram; empty ones are heartbeats
async fn recv_udp_payload(sock: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    loop {
        let n = timeout(Duration::from_secs(5), sock.recv(&mut buf))
            .await
            .expect("timed out waiting for a datagram")
            .unwrap();
        if n > 0 {
            buf.truncate(n);
            return buf;
        }
    }
}

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (client, server)
}

async fn free_addrs() -> (SocketAddr, SocketAddr) {
    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    (a.local_addr().unwrap(), b.local_addr().unwrap())
}

fn fast_rendezvous(mode: TransportMode, local: SocketAddr, peer: SocketAddr) -> RendezvousConfig {
    let mut config = RendezvousConfig::new(mode, local, peer);
    config.backoff_base_ms = 20;
    config.backoff_cap_ms = 100;
    config.heartbeat_interval_ms = 50;
    config.accept_window_ms = 1000;
    config.accept_poll_ms = 50;
    config.hand_timeout_ms = 1000;
    config.connect_timeout_ms = 500;
    config
}

#[tokio::test]
async fn test_plaintext_udp_round_trip() {
    let (a, b) = free_addrs().await;
    let flags = ControlFlags::new();
    let left_config = fast_rendezvous(TransportMode::Udp, a, b);
    let right_config = fast_rendezvous(TransportMode::Udp, b, a);

    let (left, peer) = tokio::join!(
        udp_establish(&left_config, &flags),
        udp_establish(&right_config, &flags),
    );
    let (left, peer) = (left.unwrap(), peer.unwrap());

    let (app, task) = spawn_forwarder(
        FrameTransform::RawIp,
        PacketFramer::Datagram,
        Box::new(left),
        PacketCipher::disabled(),
        &flags,
    );

    // One frame in, exactly one identical datagram out
    app.send(&ipv4_frame(2)).await.unwrap();
    assert_eq!(recv_udp_payload(&peer).await, ipv4_frame(2));

    // One datagram in, exactly one identical frame to the device
    peer.send(&ipv4_frame(1)).await.unwrap();
    assert_eq!(recv_datagram(&app).await, ipv4_frame(1));

    flags.terminate();
    let stats = task.await.unwrap().unwrap();
    assert_eq!(stats.frames_to_peer, 1);
    assert_eq!(stats.frames_from_peer, 1);
    assert_eq!(stats.bytes_sent, 20);
}

#[tokio::test]
async fn test_encrypted_stream_framing_on_the_wire() {
    let (net, mut peer) = tcp_pair().await;
    let flags = ControlFlags::new();
    let peer_cipher = PacketCipher::new(CipherKind::Aes, "correct horse").unwrap();

    let (app, task) = spawn_forwarder(
        FrameTransform::RawIp,
        PacketFramer::Stream,
        Box::new(net),
        PacketCipher::new(CipherKind::Aes, "correct horse").unwrap(),
        &flags,
    );

    // 17 bytes pad to 32, plus the 4-byte record header
    let frame: Vec<u8> = (0u8..17).collect();
    app.send(&frame).await.unwrap();

    let mut record = [0u8; 36];
    timeout(Duration::from_secs(5), peer.read_exact(&mut record))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&record[..4], &[0, 0, 0, 36]);
    let plain = peer_cipher
        .decrypt(Bytes::copy_from_slice(&record[4..]))
        .unwrap();
    assert_eq!(&plain[..], &frame[..]);

    // The same record back, dribbled in three pieces
    for piece in [&record[..3], &record[3..20], &record[20..]] {
        peer.write_all(piece).await.unwrap();
        peer.flush().await.unwrap();
        sleep(Duration::from_millis(30)).await;
    }
    assert_eq!(recv_datagram(&app).await, frame);

    flags.terminate();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_encrypted_tcp_bridge_end_to_end() {
    let (a, b) = free_addrs().await;
    let flags = ControlFlags::new();
    let left_config = fast_rendezvous(TransportMode::Tcp, a, b);
    let right_config = fast_rendezvous(TransportMode::Tcp, b, a);

    let (left, right) = tokio::join!(
        tcp_establish(&left_config, &flags),
        tcp_establish(&right_config, &flags),
    );
    let (left, right) = (left.unwrap(), right.unwrap());

    let cipher = || PacketCipher::new(CipherKind::TripleDes, "bridge").unwrap();
    let (left_app, left_task) = spawn_forwarder(
        FrameTransform::RawIp,
        PacketFramer::Stream,
        Box::new(left),
        cipher(),
        &flags,
    );
    let (right_app, right_task) = spawn_forwarder(
        FrameTransform::RawIp,
        PacketFramer::Stream,
        Box::new(right),
        cipher(),
        &flags,
    );

    for i in 0..50u8 {
        left_app.send(&ipv4_frame(i)).await.unwrap();
    }
    let big = vec![0x45u8; 1400];
    right_app.send(&big).await.unwrap();

    for i in 0..50u8 {
        assert_eq!(recv_datagram(&right_app).await, ipv4_frame(i));
    }
    assert_eq!(recv_datagram(&left_app).await, big);

    flags.terminate();
    let left_stats = left_task.await.unwrap().unwrap();
    let right_stats = right_task.await.unwrap().unwrap();
    assert_eq!(left_stats.frames_to_peer, 50);
    assert_eq!(right_stats.frames_from_peer, 50);
    assert_eq!(left_stats.frames_from_peer, 1);
}

/// Transport whose writes always fail and which never has anything to read
struct BrokenTransport;

#[async_trait]
impl PacketIo for BrokenTransport {
    async fn readable(&self) -> io::Result<()> {
        std::future::pending().await
    }

    async fn writable(&self) -> io::Result<()> {
        Ok(())
    }

    async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
        std::future::pending().await
    }

    async fn send(&self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn label(&self) -> &'static str {
        "broken"
    }
}

/// Hands out a prepared replacement and counts calls
struct Replacement {
    calls: Arc<AtomicUsize>,
    next: Option<UnixDatagram>,
}

#[async_trait]
impl Reconnect for Replacement {
    async fn reconnect(&mut self) -> Result<Box<dyn PacketIo>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next.take() {
            Some(socket) => Ok(Box::new(socket)),
            None => Err(TransportError::Closed),
        }
    }
}

#[tokio::test]
async fn test_reconnect_on_fatal_write() {
    let (dev, app) = UnixDatagram::pair().unwrap();
    let (fresh, peer) = UnixDatagram::pair().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let flags = ControlFlags::new();

    let mut config = ForwarderConfig::new(FrameTransform::RawIp, PacketFramer::Datagram);
    config.tick = Duration::from_millis(20);
    let mut forwarder = Forwarder::new(
        config,
        Box::new(dev),
        Box::new(BrokenTransport),
        PacketCipher::disabled(),
        flags.clone(),
    )
    .with_reconnect(Box::new(Replacement {
        calls: Arc::clone(&calls),
        next: Some(fresh),
    }));
    let task = tokio::spawn(async move { forwarder.run().await });

    // Queued before the failure
    for i in 0..5u8 {
        app.send(&ipv4_frame(i)).await.unwrap();
    }
    for i in 0..5u8 {
        assert_eq!(recv_datagram(&peer).await, ipv4_frame(i));
    }

    // Enqueued after the swap
    app.send(&ipv4_frame(200)).await.unwrap();
    assert_eq!(recv_datagram(&peer).await, ipv4_frame(200));

    flags.terminate();
    let stats = task.await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.frames_to_peer, 6);
}

/// Stream that takes the first 10 bytes of its first write, then breaks,
/// after handing out the head of an inbound record
struct ChokingStream {
    sends: AtomicUsize,
    inbound: Mutex<Option<Vec<u8>>>,
}

impl ChokingStream {
    fn new(inbound: Vec<u8>) -> Self {
        Self {
            sends: AtomicUsize::new(0),
            inbound: Mutex::new(Some(inbound)),
        }
    }
}

#[async_trait]
impl PacketIo for ChokingStream {
    async fn readable(&self) -> io::Result<()> {
        let pending = self.inbound.lock().unwrap().is_some();
        if pending {
            return Ok(());
        }
        std::future::pending().await
    }

    async fn writable(&self) -> io::Result<()> {
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let inbound = self.inbound.lock().unwrap().take();
        match inbound {
            Some(bytes) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            None => std::future::pending().await,
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match self.sends.fetch_add(1, Ordering::SeqCst) {
            0 => Ok(buf.len().min(10)),
            _ => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }

    fn label(&self) -> &'static str {
        "choking"
    }
}

/// Hands out a prepared replacement stream
struct StreamReplacement {
    calls: Arc<AtomicUsize>,
    next: Option<TcpStream>,
}

#[async_trait]
impl Reconnect for StreamReplacement {
    async fn reconnect(&mut self) -> Result<Box<dyn PacketIo>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next.take() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(TransportError::Closed),
        }
    }
}

fn stream_record(frame: &[u8]) -> Vec<u8> {
    PacketFramer::Stream
        .encode(Bytes::copy_from_slice(frame))
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn test_stream_reconnect_restarts_at_record_boundary() {
    let (dev, app) = UnixDatagram::pair().unwrap();
    let (fresh, mut peer) = tcp_pair().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let flags = ControlFlags::new();

    // Queued on the device before forwarding starts
    for i in 1..=3u8 {
        app.send(&ipv4_frame(i)).await.unwrap();
    }

    // The first 6 bytes of a 24-byte record, never completed
    let stray = stream_record(&ipv4_frame(100))[..6].to_vec();

    let mut config = ForwarderConfig::new(FrameTransform::RawIp, PacketFramer::Stream);
    config.tick = Duration::from_millis(20);
    let mut forwarder = Forwarder::new(
        config,
        Box::new(dev),
        Box::new(ChokingStream::new(stray)),
        PacketCipher::disabled(),
        flags.clone(),
    )
    .with_reconnect(Box::new(StreamReplacement {
        calls: Arc::clone(&calls),
        next: Some(fresh),
    }));
    let task = tokio::spawn(async move { forwarder.run().await });

    // Frame 1 was cut off mid-record; the new stream starts with frame 2's header
    for i in 2..=3u8 {
        let mut record = [0u8; 24];
        timeout(Duration::from_secs(5), peer.read_exact(&mut record))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&record[..4], &[0, 0, 0, 24]);
        assert_eq!(&record[4..], &ipv4_frame(i)[..]);
    }

    // The half-received record is gone; the next one decodes cleanly
    peer.write_all(&stream_record(&ipv4_frame(9))).await.unwrap();
    assert_eq!(recv_datagram(&app).await, ipv4_frame(9));

    flags.terminate();
    let stats = task.await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.frames_to_peer, 3);
    assert_eq!(stats.frames_from_peer, 1);
}

#[tokio::test]
async fn test_fatal_write_without_reconnect_stops() {
    let (dev, app) = UnixDatagram::pair().unwrap();
    let mut config = ForwarderConfig::new(FrameTransform::RawIp, PacketFramer::Datagram);
    config.tick = Duration::from_millis(20);
    let mut forwarder = Forwarder::new(
        config,
        Box::new(dev),
        Box::new(BrokenTransport),
        PacketCipher::disabled(),
        ControlFlags::new(),
    );
    let task = tokio::spawn(async move { forwarder.run().await });

    app.send(&ipv4_frame(1)).await.unwrap();
    let err = timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(!err.is_killed());
    assert!(err.to_string().contains("transport write"));
}

#[tokio::test]
async fn test_tap_frames_with_pi_header() {
    let (net, mut peer) = tcp_pair().await;
    let flags = ControlFlags::new();
    let (app, task) = spawn_forwarder(
        FrameTransform::EthernetPi,
        PacketFramer::Stream,
        Box::new(net),
        PacketCipher::disabled(),
        &flags,
    );

    // VLAN-tagged IPv6 frame
    let mut ethernet = vec![0xffu8; 6];
    ethernet.extend_from_slice(&[0x02, 0, 0, 0, 0, 7]);
    ethernet.extend_from_slice(&[0x81, 0x00, 0x00, 0x0a, 0x86, 0xdd]);
    ethernet.extend_from_slice(&[0x60; 40]);

    // Device -> peer: PI header removed, record header added
    let mut from_device = vec![0, 0, 0x86, 0xdd];
    from_device.extend_from_slice(&ethernet);
    app.send(&from_device).await.unwrap();

    let mut header = [0u8; 4];
    peer.read_exact(&mut header).await.unwrap();
    let total = u16::from_be_bytes([header[2], header[3]]) as usize;
    assert_eq!(total, 4 + ethernet.len());
    let mut body = vec![0u8; total - 4];
    peer.read_exact(&mut body).await.unwrap();
    assert_eq!(body, ethernet);

    // Peer -> device: PI header rebuilt from the inner EtherType
    let mut record = vec![0, 0];
    record.extend_from_slice(&(total as u16).to_be_bytes());
    record.extend_from_slice(&ethernet);
    peer.write_all(&record).await.unwrap();

    let delivered = recv_datagram(&app).await;
    assert_eq!(&delivered[..4], &[0, 0, 0x86, 0xdd]);
    assert_eq!(&delivered[4..], &ethernet[..]);

    flags.terminate();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_terminate_is_a_clean_exit() {
    let (net, _peer) = tcp_pair().await;
    let flags = ControlFlags::new();
    let (_app, task) = spawn_forwarder(
        FrameTransform::RawIp,
        PacketFramer::Stream,
        Box::new(net),
        PacketCipher::disabled(),
        &flags,
    );

    sleep(Duration::from_millis(50)).await;
    flags.terminate();
    let stats = timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats, ForwardStats::default());
}
