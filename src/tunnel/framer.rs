//! Packet framing over the transport
//!
//! Datagram transports keep packet boundaries, so every chunk is a packet.
//! Stream transports carry length-prefixed records:
//! ```text
//! +--------+--------+--------+--------+
//! |   Flags (2B)    | Total len (2B)  |
//! +--------+--------+--------+--------+
//! |  Body (frame or its ciphertext)   |
//! +--------+--------+--------+--------+
//! ```
//! The length counts the header and is big endian.

use super::{PacketQueue, TunnelError};
use crate::protocol::{MAX_RECORD_LEN, MAX_UDP_PAYLOAD, RECORD_HEADER_LEN};
use bytes::{BufMut, Bytes, BytesMut};

/// Packet framing strategy for one transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFramer {
    /// One packet per datagram
    Datagram,
    /// Length-prefixed records on a byte stream
    Stream,
}

impl PacketFramer {
    /// Framer matching a transport: UDP keeps boundaries, TCP does not
    pub fn for_transport(udp: bool) -> Self {
        if udp {
            PacketFramer::Datagram
        } else {
            PacketFramer::Stream
        }
    }

    /// Wrap a packet body for the wire
    pub fn encode(&self, body: Bytes) -> Result<Bytes, TunnelError> {
        match self {
            PacketFramer::Datagram => {
                if body.len() > MAX_UDP_PAYLOAD {
                    return Err(TunnelError::RecordTooLarge(body.len(), MAX_UDP_PAYLOAD));
                }
                Ok(body)
            }
            PacketFramer::Stream => {
                let total = RECORD_HEADER_LEN + body.len();
                if total > MAX_RECORD_LEN {
                    return Err(TunnelError::RecordTooLarge(total, MAX_RECORD_LEN));
                }

                let mut buf = BytesMut::with_capacity(total);
                buf.put_u16(0);
                buf.put_u16(total as u16);
                buf.extend_from_slice(&body);
                Ok(buf.freeze())
            }
        }
    }

    /// Check if a whole packet sits at the head of the queue
    ///
    /// On stream transports this coalesces the first two chunks at a time
    /// until either a full record is at the head or only one chunk is left.
    pub fn packet_ready(&self, queue: &mut PacketQueue) -> Result<bool, TunnelError> {
        match self {
            PacketFramer::Datagram => Ok(!queue.is_empty()),
            PacketFramer::Stream => loop {
                let Some(front) = queue.front() else {
                    return Ok(false);
                };

                if let Some(total) = record_len(front)? {
                    if front.len() >= total {
                        return Ok(true);
                    }
                }

                if !queue.merge_front() {
                    return Ok(false);
                }
            },
        }
    }

    /// Take the next packet body off the queue, if a whole one is buffered
    pub fn pull_packet(&self, queue: &mut PacketQueue) -> Result<Option<Bytes>, TunnelError> {
        if !self.packet_ready(queue)? {
            return Ok(None);
        }

        match self {
            PacketFramer::Datagram => Ok(queue.pop_front()),
            PacketFramer::Stream => {
                let Some(mut chunk) = queue.pop_front() else {
                    return Ok(None);
                };
                let Some(total) = record_len(&chunk)? else {
                    return Ok(None);
                };

                let record = chunk.split_to(total);
                queue.push_front(chunk);
                Ok(Some(record.slice(RECORD_HEADER_LEN..)))
            }
        }
    }

    /// Drop a trailing partial record, keeping every complete one
    ///
    /// Used when the stream under the queue is replaced: a half-received
    /// record can never be completed by the new connection.
    pub fn discard_partial(&self, queue: &mut PacketQueue) -> Result<usize, TunnelError> {
        if *self == PacketFramer::Datagram || queue.is_empty() {
            return Ok(0);
        }

        let all = queue.take_all();
        let mut offset = 0;
        while let Some(total) = record_len(&all[offset..])? {
            if all.len() - offset < total {
                break;
            }
            offset += total;
        }

        queue.push_back(all.slice(..offset));
        Ok(all.len() - offset)
    }
}

/// Total record length announced by a header, once the header is buffered
fn record_len(buf: &[u8]) -> Result<Option<usize>, TunnelError> {
    if buf.len() < RECORD_HEADER_LEN {
        return Ok(None);
    }

    let total = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if total < RECORD_HEADER_LEN {
        return Err(TunnelError::InvalidRecord(format!(
            "length {} shorter than header",
            total
        )));
    }
    Ok(Some(total))
}
