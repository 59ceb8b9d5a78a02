use std::net::IpAddr;

use bytes::{BufMut, BytesMut};
use rand::Rng;

/// ICMP packet types
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;
pub const ICMPV6_DEST_UNREACHABLE: u8 = 1;
pub const ICMPV6_TIME_EXCEEDED: u8 = 3;

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_ICMPV6: u8 = 58;
const IPV6_HEADER_LEN: usize = 40;
const ICMP_HEADER_LEN: usize = 8;

/// Leading payload bytes that must come back for a reply to count as ours.
pub const TRACKER_LEN: usize = 8;
/// Payload size used when none is configured (64 byte ICMP message).
pub const DEFAULT_PAYLOAD_LEN: usize = 56;
/// Largest payload that still fits one IPv4 datagram.
pub const MAX_PAYLOAD_LEN: usize = 65500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// An outgoing echo request. The random payload doubles as the tracker that
/// ties a reply to this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoRequest {
    pub family: Family,
    pub ident: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl EchoRequest {
    /// Create a new echo request with `size` random payload bytes.
    pub fn new(family: Family, ident: u16, sequence: u16, size: usize) -> Self {
        let mut payload = vec![0u8; size.max(TRACKER_LEN)];
        rand::thread_rng().fill(&mut payload[..]);
        Self::with_payload(family, ident, sequence, payload)
    }

    pub fn with_payload(family: Family, ident: u16, sequence: u16, payload: Vec<u8>) -> Self {
        Self {
            family,
            ident,
            sequence,
            payload,
        }
    }

    /// Serialize to wire bytes. IPv6 checksums are filled in by the kernel.
    pub fn to_bytes(&self) -> Vec<u8> {
        let icmp_type = match self.family {
            Family::V4 => ICMP_ECHO_REQUEST,
            Family::V6 => ICMPV6_ECHO_REQUEST,
        };

        let mut packet = BytesMut::with_capacity(ICMP_HEADER_LEN + self.payload.len());
        packet.put_u8(icmp_type);
        packet.put_u8(0);
        packet.put_u16(0); // Checksum will be calculated later
        packet.put_u16(self.ident);
        packet.put_u16(self.sequence);
        packet.extend_from_slice(&self.payload);

        let mut bytes = packet.to_vec();
        if self.family == Family::V4 {
            let checksum = calculate_checksum(&bytes);
            bytes[2..4].copy_from_slice(&checksum.to_be_bytes());
        }
        bytes
    }
}

/// Echo header and payload, either from a reply or quoted inside an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Echo<'a> {
    pub ident: u16,
    pub sequence: u16,
    pub payload: &'a [u8],
}

/// The ICMP messages a prober cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message<'a> {
    EchoReply(Echo<'a>),
    /// `invoking` is the quoted echo request, when the quote is one.
    DestinationUnreachable { code: u8, invoking: Option<Echo<'a>> },
    TimeExceeded { code: u8, invoking: Option<Echo<'a>> },
}

impl<'a> Message<'a> {
    /// The same message with the echo identifier replaced.
    pub fn with_ident(self, ident: u16) -> Self {
        let swap = |echo: Option<Echo<'a>>| echo.map(|echo| Echo { ident, ..echo });
        match self {
            Message::EchoReply(echo) => Message::EchoReply(Echo { ident, ..echo }),
            Message::DestinationUnreachable { code, invoking } => Message::DestinationUnreachable {
                code,
                invoking: swap(invoking),
            },
            Message::TimeExceeded { code, invoking } => Message::TimeExceeded {
                code,
                invoking: swap(invoking),
            },
        }
    }
}

/// Parse a received packet. `None` means the packet is of no interest:
/// another type, or too short to parse.
pub fn parse(data: &[u8], family: Family) -> Option<Message<'_>> {
    let icmp = match family {
        Family::V4 => strip_ipv4_header(data)?,
        Family::V6 => data,
    };
    if icmp.len() < ICMP_HEADER_LEN {
        return None;
    }

    let (icmp_type, code) = (icmp[0], icmp[1]);
    let body = &icmp[ICMP_HEADER_LEN..];
    match (family, icmp_type) {
        (Family::V4, ICMP_ECHO_REPLY) | (Family::V6, ICMPV6_ECHO_REPLY) => {
            Some(Message::EchoReply(echo_fields(icmp)))
        }
        (Family::V4, ICMP_DEST_UNREACHABLE) | (Family::V6, ICMPV6_DEST_UNREACHABLE) => {
            Some(Message::DestinationUnreachable {
                code,
                invoking: invoking_echo(body, family),
            })
        }
        (Family::V4, ICMP_TIME_EXCEEDED) | (Family::V6, ICMPV6_TIME_EXCEEDED) => {
            Some(Message::TimeExceeded {
                code,
                invoking: invoking_echo(body, family),
            })
        }
        _ => None,
    }
}

/// Rebuild an ICMP error the kernel queued on a datagram socket from its
/// type and code. `quoted` is the offending request from its ICMP header on.
pub fn queued_error(icmp_type: u8, code: u8, quoted: &[u8], family: Family) -> Option<Message<'_>> {
    let invoking = request_echo(quoted, family);
    match (family, icmp_type) {
        (Family::V4, ICMP_DEST_UNREACHABLE) | (Family::V6, ICMPV6_DEST_UNREACHABLE) => {
            Some(Message::DestinationUnreachable { code, invoking })
        }
        (Family::V4, ICMP_TIME_EXCEEDED) | (Family::V6, ICMPV6_TIME_EXCEEDED) => {
            Some(Message::TimeExceeded { code, invoking })
        }
        _ => None,
    }
}

fn echo_fields(icmp: &[u8]) -> Echo<'_> {
    Echo {
        ident: u16::from_be_bytes([icmp[4], icmp[5]]),
        sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
        payload: &icmp[ICMP_HEADER_LEN..],
    }
}

/// Raw IPv4 sockets (and datagram sockets on Darwin) deliver the IP header
/// too. No ICMP type in use starts with a 0x4 nibble, so the version nibble
/// tells the two apart.
fn strip_ipv4_header(data: &[u8]) -> Option<&[u8]> {
    match data.first() {
        Some(first) if first >> 4 == 4 => {
            let header_len = ((first & 0x0f) as usize) * 4;
            if header_len < 20 || data.len() < header_len {
                return None;
            }
            Some(&data[header_len..])
        }
        Some(_) => Some(data),
        None => None,
    }
}

/// Extract the echo request quoted in an ICMP error body.
fn invoking_echo(quoted: &[u8], family: Family) -> Option<Echo<'_>> {
    let icmp = match family {
        Family::V4 => {
            let first = *quoted.first()?;
            let header_len = ((first & 0x0f) as usize) * 4;
            if first >> 4 != 4 || header_len < 20 || quoted.len() < header_len {
                return None;
            }
            if quoted[9] != IPPROTO_ICMP {
                return None;
            }
            &quoted[header_len..]
        }
        Family::V6 => {
            if quoted.len() < IPV6_HEADER_LEN || quoted[0] >> 4 != 6 {
                return None;
            }
            if quoted[6] != IPPROTO_ICMPV6 {
                return None;
            }
            &quoted[IPV6_HEADER_LEN..]
        }
    };
    request_echo(icmp, family)
}

fn request_echo(icmp: &[u8], family: Family) -> Option<Echo<'_>> {
    let request_type = match family {
        Family::V4 => ICMP_ECHO_REQUEST,
        Family::V6 => ICMPV6_ECHO_REQUEST,
    };
    if icmp.len() < ICMP_HEADER_LEN || icmp[0] != request_type {
        return None;
    }
    Some(echo_fields(icmp))
}

/// Human readable destination unreachable code.
pub fn unreachable_reason(family: Family, code: u8) -> &'static str {
    match (family, code) {
        (Family::V4, 0) => "network unreachable",
        (Family::V4, 1) => "host unreachable",
        (Family::V4, 2) => "protocol unreachable",
        (Family::V4, 3) => "port unreachable",
        (Family::V4, 4) => "fragmentation needed",
        (Family::V4, 9 | 10 | 13) => "administratively prohibited",
        (Family::V6, 0) => "no route to destination",
        (Family::V6, 1) => "administratively prohibited",
        (Family::V6, 3) => "address unreachable",
        (Family::V6, 4) => "port unreachable",
        _ => "unreachable",
    }
}

/// Calculate ICMP checksum
pub fn calculate_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    // Sum all 16-bit words
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]]) as u32
        } else {
            (chunk[0] as u32) << 8
        };
        sum += word;
    }

    // Add carry bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    // One's complement
    !(sum as u16)
}
