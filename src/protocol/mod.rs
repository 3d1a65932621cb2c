//! Wire constants shared by the codec, the framer and the rendezvous code

use std::time::Duration;

/// TUN/TAP packet-information header: `[flags u16][proto u16]`
pub const PI_HEADER_LEN: usize = 4;

/// Stream record header: `[flags u16][total length u16]`, big endian
pub const RECORD_HEADER_LEN: usize = 4;

/// Largest record the 16-bit length field can describe
pub const MAX_RECORD_LEN: usize = u16::MAX as usize;

/// Untagged Ethernet header length
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Extra bytes added by one 802.1Q tag
pub const VLAN_TAG_LEN: usize = 4;

/// EtherType values the codec understands
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

/// Rendezvous token length in bytes
pub const HAND_LEN: usize = 4;

/// How long a peer gets to send its hand
pub const HAND_TIMEOUT: Duration = Duration::from_secs(10);

/// UDP keepalive period during the rendezvous handshake
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Read buffer size for datagram endpoints (transport and device)
pub const MAX_DATAGRAM: usize = 65536;

/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_UDP_PAYLOAD: usize = 65507;
