//! Configuration management

use crate::crypto::{CryptoError, PacketCipher};
use crate::transport::{RendezvousConfig, TransportMode};
use crate::tunnel::{
    FrameTransform, ForwarderConfig, PacketFramer, DEFAULT_BATCH, DEFAULT_HIGH_WATER,
    DEFAULT_LOW_WATER,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Forwarding configuration
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Rendezvous configuration
    #[serde(default)]
    pub rendezvous: RendezvousConfig,
    /// Cipher configuration; absent means plaintext
    pub cipher: Option<CipherConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject settings the forwarder cannot run with
    pub fn validate(&self) -> Result<(), crate::Error> {
        let bridge = &self.bridge;
        if bridge.low_water > bridge.high_water {
            return Err(crate::Error::Config(format!(
                "low_water ({}) exceeds high_water ({})",
                bridge.low_water, bridge.high_water
            )));
        }
        if bridge.batch == 0 {
            return Err(crate::Error::Config("batch must be at least 1".to_string()));
        }
        if bridge.mtu < 576 {
            return Err(crate::Error::Config(format!("mtu {} is too small", bridge.mtu)));
        }
        if bridge.bandwidth_kbps == Some(0) {
            return Err(crate::Error::Config(
                "bandwidth_kbps must be positive; omit it for no limit".to_string(),
            ));
        }
        if self.rendezvous.bind_attempts == 0
            || self.rendezvous.tcp_rounds == 0
            || self.rendezvous.race_attempts == 0
        {
            return Err(crate::Error::Config(
                "rendezvous attempt ceilings must be at least 1".to_string(),
            ));
        }
        if let Some(cipher) = &self.cipher {
            if let Some(name) = &cipher.name {
                name.parse::<crate::crypto::CipherKind>()?;
            }
        }
        Ok(())
    }

    /// Forwarder settings for the configured transport
    pub fn forwarder_config(&self) -> ForwarderConfig {
        let bridge = &self.bridge;
        let transform = FrameTransform::select(bridge.ethernet_mode, bridge.with_pi);
        let framer = PacketFramer::for_transport(self.rendezvous.mode == TransportMode::Udp);

        let mut config = ForwarderConfig::new(transform, framer);
        config.bandwidth = bridge.bandwidth_kbps.map(|kbps| kbps * 1000 / 8);
        config.high_water = bridge.high_water;
        config.low_water = bridge.low_water;
        config.batch = bridge.batch;
        config.tick = Duration::from_millis(bridge.tick_ms.max(1));
        config.suspend_poll = Duration::from_millis(bridge.suspend_poll_ms.max(1));
        config.mtu = bridge.mtu;
        config
    }

    /// Build the packet cipher; plaintext when no passphrase is set
    pub fn packet_cipher(&self) -> Result<PacketCipher, CryptoError> {
        match &self.cipher {
            Some(cipher) => {
                PacketCipher::from_settings(cipher.name.as_deref(), cipher.passphrase.as_deref())
            }
            None => PacketCipher::from_settings(None, None),
        }
    }
}

/// Forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// The device carries Ethernet frames (TAP) instead of IP packets (TUN)
    pub ethernet_mode: bool,
    /// The device prefixes frames with a 4-byte packet-information header
    pub with_pi: bool,
    /// Transport ceiling in kilobits per second
    pub bandwidth_kbps: Option<u64>,
    /// Queue high-water mark in bytes
    pub high_water: usize,
    /// Queue low-water mark in bytes
    pub low_water: usize,
    /// Packets serviced per endpoint per tick
    pub batch: usize,
    /// Readiness wait timeout in milliseconds
    pub tick_ms: u64,
    /// Poll interval while suspended, in milliseconds
    pub suspend_poll_ms: u64,
    /// Largest device frame forwarded; bigger ones are dropped
    pub mtu: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ethernet_mode: false,
            with_pi: false,
            bandwidth_kbps: None,
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
            batch: DEFAULT_BATCH,
            tick_ms: 100,
            suspend_poll_ms: 100,
            mtu: 65536,
        }
    }
}

/// Cipher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CipherConfig {
    /// Cipher name (aes, blowfish, des, 3des); defaults to aes
    pub name: Option<String>,
    /// Shared passphrase
    pub passphrase: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        bridge: BridgeConfig::default(),
        rendezvous: RendezvousConfig::default(),
        cipher: Some(CipherConfig {
            name: Some("aes".to_string()),
            passphrase: Some("change me".to_string()),
        }),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherKind;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.cipher.is_none());
        assert_eq!(config.bridge.high_water, 256 * 1024);
        assert_eq!(config.bridge.low_water, 64 * 1024);
        assert_eq!(config.rendezvous.mode, TransportMode::Tcp);
        assert_eq!(config.logging.level, "info");

        let forwarder = config.forwarder_config();
        assert_eq!(forwarder.framer, PacketFramer::Stream);
        assert_eq!(forwarder.transform, FrameTransform::RawIp);
        assert_eq!(forwarder.tick, Duration::from_millis(100));
        assert!(forwarder.bandwidth.is_none());
        assert!(!config.packet_cipher().unwrap().is_enabled());
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [bridge]
            ethernet_mode = true
            with_pi = true
            bandwidth_kbps = 8000

            [rendezvous]
            mode = "udp"
            local = "0.0.0.0:5000"
            peer = "198.51.100.4:5000"

            [cipher]
            name = "blowfish"
            passphrase = "hunter2"

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        let forwarder = config.forwarder_config();
        assert_eq!(forwarder.framer, PacketFramer::Datagram);
        assert_eq!(forwarder.transform, FrameTransform::EthernetPi);
        assert_eq!(forwarder.bandwidth, Some(1_000_000));

        let cipher = config.packet_cipher().unwrap();
        assert_eq!(cipher.kind(), Some(CipherKind::Blowfish));
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::parse("[bridge]\nlow_water = 10\nhigh_water = 5\n").is_err());
        assert!(Config::parse("[bridge]\nbatch = 0\n").is_err());
        assert!(Config::parse("[bridge]\nbandwidth_kbps = 0\n").is_err());
        assert!(Config::parse("[cipher]\nname = \"rot13\"\npassphrase = \"x\"\n").is_err());
        assert!(Config::parse("[rendezvous]\nmode = \"sctp\"\n").is_err());
    }

    #[test]
    fn test_example_round_trips() {
        let example = generate_example_config();
        let text = toml::to_string_pretty(&example).unwrap();
        let parsed = Config::parse(&text).unwrap();

        assert_eq!(parsed.rendezvous.peer, example.rendezvous.peer);
        assert_eq!(parsed.packet_cipher().unwrap().kind(), Some(CipherKind::Aes));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("tunbridge-{}.toml", std::process::id()));
        let mut config = Config::default();
        config.bridge.batch = 4;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.bridge.batch, 4);
        std::fs::remove_file(&path).unwrap();
    }
}
