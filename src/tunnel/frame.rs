//! TUN/TAP frame codec
//!
//! Some TUN/TAP APIs prefix every frame with a packet-information header:
//! ```text
//! +--------+--------+--------+--------+
//! |   Flags (2B)    |  Protocol (2B)  |
//! +--------+--------+--------+--------+
//! |          Frame (IP or Ethernet)   |
//! +--------+--------+--------+--------+
//! ```
//! The protocol is an EtherType in network byte order. The header never goes
//! on the wire; it is stripped on read and rebuilt on write.

use crate::protocol::{
    ETHERNET_HEADER_LEN, ETHERTYPE_ARP, ETHERTYPE_IPV4, ETHERTYPE_IPV6, ETHERTYPE_VLAN,
    PI_HEADER_LEN, VLAN_TAG_LEN,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::warn;

/// Remove the PI header from a frame read off the device
///
/// Frames shorter than the header are returned unchanged.
pub fn strip_pi(frame: Bytes) -> Bytes {
    if frame.len() < PI_HEADER_LEN {
        warn!("Malformed frame: {} bytes, shorter than PI header", frame.len());
        return frame;
    }
    frame.slice(PI_HEADER_LEN..)
}

/// Prepend a PI header to a frame about to be written to the device
pub fn wrap_pi(frame: &[u8], ethernet_mode: bool) -> Bytes {
    let proto = if ethernet_mode {
        ether_proto(frame).unwrap_or_else(|| {
            warn!("Malformed ethernet frame: {} bytes", frame.len());
            0
        })
    } else {
        ETHERTYPE_IPV4
    };

    let mut buf = BytesMut::with_capacity(PI_HEADER_LEN + frame.len());
    buf.put_u16(0);
    buf.put_u16(proto);
    buf.extend_from_slice(frame);
    buf.freeze()
}

/// EtherType of an Ethernet frame, looking through one 802.1Q tag
pub fn ether_proto(frame: &[u8]) -> Option<u16> {
    let proto = read_u16(frame, ETHERNET_HEADER_LEN - 2)?;
    if proto == ETHERTYPE_VLAN {
        read_u16(frame, ETHERNET_HEADER_LEN + VLAN_TAG_LEN - 2)
    } else {
        Some(proto)
    }
}

/// Payload of an Ethernet frame carrying IPv4, IPv6 or ARP
///
/// Returns an empty buffer when the frame is not a recognised Ethernet frame.
pub fn ethernet_strip(frame: &Bytes) -> Bytes {
    let offset = match read_u16(frame, ETHERNET_HEADER_LEN - 2) {
        Some(ETHERTYPE_VLAN) => ETHERNET_HEADER_LEN + VLAN_TAG_LEN,
        Some(_) => ETHERNET_HEADER_LEN,
        None => return Bytes::new(),
    };

    match read_u16(frame, offset - 2) {
        Some(ETHERTYPE_IPV4 | ETHERTYPE_IPV6 | ETHERTYPE_ARP) => frame.slice(offset..),
        _ => Bytes::new(),
    }
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Human-readable one-liner for trace logging
pub fn describe_frame(frame: &Bytes, ethernet_mode: bool) -> String {
    let ip = if ethernet_mode {
        let payload = ethernet_strip(frame);
        if payload.is_empty() {
            return format!("malformed ethernet frame ({} bytes)", frame.len());
        }
        payload
    } else {
        frame.clone()
    };

    match ip.first().map(|b| b >> 4) {
        Some(4) if ip.len() >= 20 => {
            let src = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
            let dst = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
            format!("{} -> {} proto {} len {}", src, dst, ip[9], frame.len())
        }
        Some(6) if ip.len() >= 40 => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&ip[8..24]);
            dst.copy_from_slice(&ip[24..40]);
            format!(
                "{} -> {} next {} len {}",
                Ipv6Addr::from(src),
                Ipv6Addr::from(dst),
                ip[6],
                frame.len()
            )
        }
        _ => format!("malformed ({} bytes)", frame.len()),
    }
}

/// How frames are converted between the device and the wire
///
/// Chosen once from the device configuration; the forwarding loop never
/// looks at the mode flags again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTransform {
    /// TUN without PI header: frames are bare IP packets
    RawIp,
    /// TUN with PI header
    IpPi,
    /// TAP with PI header
    EthernetPi,
    /// TAP without PI header: frames are bare Ethernet frames
    RawEthernet,
}

impl FrameTransform {
    /// Select the transform for a device
    pub fn select(ethernet_mode: bool, with_pi: bool) -> Self {
        match (ethernet_mode, with_pi) {
            (false, false) => FrameTransform::RawIp,
            (false, true) => FrameTransform::IpPi,
            (true, true) => FrameTransform::EthernetPi,
            (true, false) => FrameTransform::RawEthernet,
        }
    }

    /// Check if frames are Ethernet frames
    pub fn is_ethernet(&self) -> bool {
        matches!(self, FrameTransform::EthernetPi | FrameTransform::RawEthernet)
    }

    /// Turn a raw device read into a wire frame
    pub fn from_tun(&self, raw: Bytes) -> Bytes {
        match self {
            FrameTransform::IpPi | FrameTransform::EthernetPi => strip_pi(raw),
            FrameTransform::RawIp | FrameTransform::RawEthernet => raw,
        }
    }

    /// Turn a wire frame into what the device expects
    pub fn to_tun(&self, frame: Bytes) -> Bytes {
        match self {
            FrameTransform::IpPi => wrap_pi(&frame, false),
            FrameTransform::EthernetPi => wrap_pi(&frame, true),
            FrameTransform::RawIp | FrameTransform::RawEthernet => frame,
        }
    }

    /// Describe a wire frame for logging
    pub fn describe(&self, frame: &Bytes) -> String {
        describe_frame(frame, self.is_ethernet())
    }
}
