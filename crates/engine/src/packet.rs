#![forbid(unsafe_code)]

//! Header parsing for the packet path.
//!
//! Nothing here allocates per packet except the DNS question name, and
//! nothing here fails loudly: a packet that does not parse is simply not
//! divertable.

use crate::flow::{FlowKey, Protocol};
use etherparse::{NetHeaders, PacketHeaders, TransportHeader};
use hickory_proto::op::Message;
use std::{net::SocketAddrV4, ops::Range};

pub const DNS_PORT: u16 = 53;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

/// Decision-relevant view of an outbound IPv4 packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedPacket<'a> {
    pub key: FlowKey,
    /// UDP payload of packets to or from port 53.
    pub dns: Option<&'a [u8]>,
}

/// Parse an IPv4 TCP/UDP packet. Anything else yields `None`.
pub fn parse(packet: &[u8]) -> Option<ParsedPacket<'_>> {
    let headers = PacketHeaders::from_ip_slice(packet).ok()?;
    let Some(NetHeaders::Ipv4(ip, _)) = &headers.net else {
        return None;
    };
    let (protocol, src_port, dst_port) = match headers.transport.as_ref()? {
        TransportHeader::Tcp(tcp) => (Protocol::Tcp, tcp.source_port, tcp.destination_port),
        TransportHeader::Udp(udp) => (Protocol::Udp, udp.source_port, udp.destination_port),
        _ => return None,
    };

    // outbound only: the source is the local end
    let key = FlowKey::new(
        SocketAddrV4::new(ip.source.into(), src_port),
        SocketAddrV4::new(ip.destination.into(), dst_port),
        protocol,
    );
    let dns = (protocol == Protocol::Udp && (src_port == DNS_PORT || dst_port == DNS_PORT))
        .then(|| headers.payload.slice());

    Some(ParsedPacket { key, dns })
}

/// Name of the first question of a DNS message, lowercased and without the
/// trailing root dot. Messages without questions yield `None`.
pub fn dns_question(payload: &[u8]) -> Option<String> {
    let message = Message::from_vec(payload).ok()?;
    let query = message.queries().first()?;
    let name = query.name().to_utf8();
    let name = name.trim_end_matches('.');
    if name.is_empty() {
        None
    } else {
        Some(name.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed IP header: version {version}, declared length {length}")]
pub struct MalformedHeader {
    pub version: u8,
    pub length: usize,
}

/// Length of the IP packet starting at `buf[0]`, from its header.
///
/// `Ok(None)` means the header itself is still incomplete.
pub fn packet_len(buf: &[u8]) -> Result<Option<usize>, MalformedHeader> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let version = first >> 4;
    match version {
        4 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            let header = usize::from(first & 0x0f) * 4;
            let total = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
            if header < IPV4_MIN_HEADER || total < header {
                return Err(MalformedHeader {
                    version,
                    length: total,
                });
            }
            Ok(Some(total))
        }
        6 => {
            if buf.len() < 6 {
                return Ok(None);
            }
            let payload = usize::from(u16::from_be_bytes([buf[4], buf[5]]));
            Ok(Some(IPV6_HEADER + payload))
        }
        _ => Err(MalformedHeader { version, length: 0 }),
    }
}

/// Result of cutting a byte stream into whole IP packets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Split {
    /// Byte ranges of complete packets, in order.
    pub packets: Vec<Range<usize>>,
    /// Bytes covered by `packets`. Anything after is an incomplete packet.
    pub consumed: usize,
    /// Set when splitting stopped at a header that can never become valid.
    pub malformed: Option<MalformedHeader>,
}

/// Cut `buf` into consecutive IP packets using each header's length field.
pub fn split(buf: &[u8]) -> Split {
    let mut split = Split::default();
    while split.consumed < buf.len() {
        let rest = &buf[split.consumed..];
        match packet_len(rest) {
            Ok(Some(len)) if len <= rest.len() => {
                split.packets.push(split.consumed..split.consumed + len);
                split.consumed += len;
            }
            Ok(_) => break,
            Err(err) => {
                split.malformed = Some(err);
                break;
            }
        }
    }
    split
}
