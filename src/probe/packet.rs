//! ICMP echo encoding and decoding.
//!
//! Echo payload layout:
//!
//! ```text
//! 0       8       16          payload_size
//! +-------+-------+-----------+
//! |tracker|sent at|  padding  |
//! +-------+-------+-----------+
//! ```
//!
//! Both fields are big-endian u64; `sent at` is nanoseconds since the
//! prober's epoch.

use std::net::IpAddr;

use crate::error::ProbeError;

/// ICMP header length (type, code, checksum, identifier, sequence).
pub const ICMP_HEADER_LEN: usize = 8;

/// Smallest payload able to carry tracker and timestamp.
pub const MIN_PAYLOAD_SIZE: usize = 16;

const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Address family of a probe socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::V4 => "IPv4",
            Self::V6 => "IPv6",
        }
    }

    fn echo_request(self) -> u8 {
        match self {
            Self::V4 => ICMPV4_ECHO_REQUEST,
            Self::V6 => ICMPV6_ECHO_REQUEST,
        }
    }

    fn echo_reply(self) -> u8 {
        match self {
            Self::V4 => ICMPV4_ECHO_REPLY,
            Self::V6 => ICMPV6_ECHO_REPLY,
        }
    }
}

/// Outbound echo request.
#[derive(Debug, Clone, Copy)]
pub struct EchoRequest {
    pub identifier: u16,
    pub sequence: u16,
    pub tracker: u64,
    /// Nanoseconds since the prober epoch.
    pub sent_at: u64,
}

impl EchoRequest {
    /// Build the ICMP message. The IPv6 checksum is left zero; the kernel
    /// fills it in from the pseudo-header.
    pub fn encode(&self, family: Family, payload_size: usize) -> Result<Vec<u8>, ProbeError> {
        if payload_size < MIN_PAYLOAD_SIZE {
            return Err(ProbeError::PayloadTooSmall {
                size: payload_size,
                min: MIN_PAYLOAD_SIZE,
            });
        }

        let mut buf = vec![0u8; ICMP_HEADER_LEN + payload_size];
        buf[0] = family.echo_request();
        buf[4..6].copy_from_slice(&self.identifier.to_be_bytes());
        buf[6..8].copy_from_slice(&self.sequence.to_be_bytes());
        buf[8..16].copy_from_slice(&self.tracker.to_be_bytes());
        buf[16..24].copy_from_slice(&self.sent_at.to_be_bytes());

        if family == Family::V4 {
            let sum = checksum(&buf);
            buf[2..4].copy_from_slice(&sum.to_be_bytes());
        }
        Ok(buf)
    }
}

/// A decoded echo reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub identifier: u16,
    pub sequence: u16,
    pub tracker: u64,
    pub sent_at: u64,
    /// TTL of the reply, when the IP header was delivered.
    pub ttl: Option<u8>,
}

/// Decode a received datagram.
///
/// An IPv4 header in front of the message (raw sockets, and datagram
/// sockets on some platforms) is detected and stripped. Returns `Ok(None)`
/// for ICMP messages other than echo replies.
pub fn parse_reply(buf: &[u8], family: Family) -> Result<Option<EchoReply>, ProbeError> {
    let mut ttl = None;
    let mut msg = buf;

    // An echo reply starts with type 0, so a version nibble of 4 can only
    // be an IP header.
    if family == Family::V4 && buf.first().is_some_and(|b| b >> 4 == 4) {
        let ihl = usize::from(buf[0] & 0x0f) * 4;
        if ihl < 20 || buf.len() < ihl {
            return Err(ProbeError::Malformed(format!("truncated IPv4 header ({} bytes)", buf.len())));
        }
        ttl = Some(buf[8]);
        msg = &buf[ihl..];
    }

    if msg.len() < ICMP_HEADER_LEN {
        return Err(ProbeError::Malformed(format!("short ICMP message ({} bytes)", msg.len())));
    }
    if msg[0] != family.echo_reply() || msg[1] != 0 {
        return Ok(None);
    }
    if msg.len() < ICMP_HEADER_LEN + MIN_PAYLOAD_SIZE {
        return Err(ProbeError::Malformed(format!("echo payload too short ({} bytes)", msg.len() - ICMP_HEADER_LEN)));
    }

    let u16_at = |i: usize| u16::from_be_bytes([msg[i], msg[i + 1]]);
    let u64_at = |i: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&msg[i..i + 8]);
        u64::from_be_bytes(b)
    };

    Ok(Some(EchoReply {
        identifier: u16_at(4),
        sequence: u16_at(6),
        tracker: u64_at(8),
        sent_at: u64_at(16),
        ttl,
    }))
}

/// RFC 1071 internet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|c| match c {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
