//! tunbridge
//!
//! Bridges an already-open TUN/TAP descriptor to a peer over TCP or UDP:
//! - Establishes the transport by rendezvous (no fixed client/server roles)
//! - Forwards frames until SIGINT/SIGTERM
//! - SIGUSR1 suspends forwarding, SIGUSR2 resumes it
//! - Re-runs the rendezvous if the transport fails

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;
use tunbridge::{
    config::{generate_example_config, CipherConfig, Config},
    transport::{establish, RendezvousReconnect, TransportMode, TunFd},
    ControlFlags, Forwarder, VERSION,
};

/// tunbridge - TUN/TAP to TCP/UDP packet bridge
#[derive(Parser, Debug)]
#[command(name = "tunbridge")]
#[command(about = "Bridge a TUN/TAP device to a remote peer over TCP or UDP")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "tunbridge.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Inherited, already configured TUN/TAP descriptor
    #[arg(long)]
    tun_fd: Option<i32>,

    /// Local address (overrides config)
    #[arg(short, long)]
    local: Option<SocketAddr>,

    /// Peer address (overrides config)
    #[arg(short, long)]
    peer: Option<SocketAddr>,

    /// Use UDP instead of TCP
    #[arg(long)]
    udp: bool,

    /// The device is a TAP device carrying Ethernet frames
    #[arg(long)]
    ethernet: bool,

    /// The device prefixes frames with a packet-information header
    #[arg(long)]
    pi: bool,

    /// Cipher name (aes, blowfish, des, 3des)
    #[arg(long)]
    cipher: Option<String>,

    /// Shared passphrase; enables encryption
    #[arg(long)]
    passphrase: Option<String>,

    /// Transport ceiling in kilobits per second
    #[arg(long)]
    bandwidth_kbps: Option<u64>,

    /// Exit instead of reconnecting when the transport fails
    #[arg(long)]
    no_reconnect: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long)]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to render example config")?;
        println!("{}", example);
        return Ok(());
    }

    let config_found = Path::new(&args.config).exists();
    let mut config = if config_found {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    init_logging(&config).context("Failed to initialize logging")?;
    info!("tunbridge {} starting ({} mode)", VERSION, config.rendezvous.mode);
    if !config_found {
        info!("No config file at {}, using defaults", args.config);
    }

    let fd = args
        .tun_fd
        .ok_or_else(|| anyhow!("No TUN/TAP descriptor given (--tun-fd)"))?;
    // SAFETY: the descriptor is inherited from the parent and owned by this process alone
    let tun = unsafe { TunFd::from_raw_fd(fd) }
        .with_context(|| format!("Failed to register TUN/TAP descriptor {}", fd))?;

    let cipher = config.packet_cipher().context("Invalid cipher settings")?;

    let flags = ControlFlags::new();
    spawn_signal_handler(flags.clone()).context("Failed to install signal handlers")?;

    let transport = match establish(&config.rendezvous, &flags).await {
        Ok(transport) => transport,
        Err(e) if e.is_killed() => {
            info!("Stopped before the transport came up");
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to establish transport"),
    };

    let mut forwarder = Forwarder::new(
        config.forwarder_config(),
        Box::new(tun),
        transport,
        cipher,
        flags.clone(),
    );
    if !args.no_reconnect {
        forwarder = forwarder.with_reconnect(Box::new(RendezvousReconnect::new(
            config.rendezvous.clone(),
            flags.clone(),
        )));
    }

    let stats = forwarder.run().await.context("Forwarding failed")?;
    info!(
        "Stopped: {} frames ({} bytes) to peer, {} frames ({} bytes) from peer, {} reconnect(s)",
        stats.frames_to_peer,
        stats.bytes_sent,
        stats.frames_from_peer,
        stats.bytes_received,
        stats.reconnects
    );
    Ok(())
}

/// Command-line values win over the config file
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(local) = args.local {
        config.rendezvous.local = local;
    }
    if let Some(peer) = args.peer {
        config.rendezvous.peer = peer;
    }
    if args.udp {
        config.rendezvous.mode = TransportMode::Udp;
    }
    if args.ethernet {
        config.bridge.ethernet_mode = true;
    }
    if args.pi {
        config.bridge.with_pi = true;
    }
    if args.bandwidth_kbps.is_some() {
        config.bridge.bandwidth_kbps = args.bandwidth_kbps;
    }
    if args.cipher.is_some() || args.passphrase.is_some() {
        let cipher = config.cipher.get_or_insert_with(CipherConfig::default);
        if let Some(name) = &args.cipher {
            cipher.name = Some(name.clone());
        }
        if let Some(passphrase) = &args.passphrase {
            cipher.passphrase = Some(passphrase.clone());
        }
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &args.log_format {
        config.logging.format = format.clone();
    }
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.logging.level)
        .with_context(|| format!("Invalid log level '{}'", config.logging.level))?;

    let (writer, ansi) = match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi);

    match config.logging.format.as_str() {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        "pretty" => builder.pretty().init(),
        other => {
            builder.init();
            warn!("Unknown log format '{}', using the default", other);
        }
    }
    Ok(())
}

/// Map signals onto the control flags
fn spawn_signal_handler(flags: ControlFlags) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut suspend = signal(SignalKind::user_defined1())?;
    let mut resume = signal(SignalKind::user_defined2())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    info!("SIGINT received, shutting down");
                    flags.terminate();
                }
                _ = terminate.recv() => {
                    info!("SIGTERM received, shutting down");
                    flags.terminate();
                }
                _ = suspend.recv() => {
                    info!("SIGUSR1 received, suspending forwarding");
                    flags.suspend();
                }
                _ = resume.recv() => {
                    info!("SIGUSR2 received, resuming forwarding");
                    flags.resume();
                }
            }
        }
    });

    Ok(())
}
