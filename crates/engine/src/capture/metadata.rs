#![forbid(unsafe_code)]

use crate::{
    flow::{FlowKey, Protocol},
    packet,
};
use bitflags::bitflags;
use std::{
    net::{IpAddr, SocketAddr, SocketAddrV4},
    ops::Range,
};
use tracing::warn;

bitflags! {
    /// Direction and classification bits of a captured packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MetaFlags: u32 {
        const SNIFFED = 1 << 0;
        const OUTBOUND = 1 << 1;
        const LOOPBACK = 1 << 2;
        /// Injected by a user-space program. Filters excluding impostors
        /// never see the packet again.
        const IMPOSTOR = 1 << 3;
        const IPV6 = 1 << 4;
        const IP_CHECKSUM = 1 << 5;
        const TCP_CHECKSUM = 1 << 6;
        const UDP_CHECKSUM = 1 << 7;
    }
}

/// Per-packet descriptor exchanged with the capture layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureMetadata {
    pub timestamp: i64,
    pub interface: u32,
    pub subinterface: u32,
    pub flags: MetaFlags,
}

impl CaptureMetadata {
    /// Metadata for packets produced by the TCP/IP stack.
    ///
    /// The packets are injected inbound on the egress interface and marked as
    /// impostors, so no capture filter picks them up again. Checksum-valid
    /// bits are cleared so the driver recomputes them.
    pub fn reinjection(interface: u32, subinterface: u32) -> Self {
        Self {
            timestamp: 0,
            interface,
            subinterface,
            flags: MetaFlags::IMPOSTOR,
        }
    }

    pub fn is_outbound(&self) -> bool {
        self.flags.contains(MetaFlags::OUTBOUND)
    }
}

/// Socket-layer event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEventKind {
    Bind,
    Connect,
    Listen,
    Accept,
    Close,
}

/// A decoded socket-layer event. Carries no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketEvent {
    pub kind: SocketEventKind,
    pub pid: u32,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    /// IP protocol number.
    pub protocol: u8,
}

impl SocketEvent {
    /// Flow key of an IPv4 TCP/UDP event.
    pub fn flow_key(&self) -> Option<FlowKey> {
        let protocol = Protocol::from_number(self.protocol)?;
        let (IpAddr::V4(local), IpAddr::V4(remote)) = (self.local.ip(), self.remote.ip()) else {
            return None;
        };
        Some(FlowKey::new(
            SocketAddrV4::new(local, self.local.port()),
            SocketAddrV4::new(remote, self.remote.port()),
            protocol,
        ))
    }
}

/// Packets moved by one batched receive or send.
///
/// Payload bytes are contiguous; each packet is delimited by its own IP
/// length field and has exactly one metadata entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketBatch {
    payload: Vec<u8>,
    spans: Vec<Range<usize>>,
    metadata: Vec<CaptureMetadata>,
}

impl PacketBatch {
    pub fn with_capacity(packets: usize, bytes: usize) -> Self {
        Self {
            payload: Vec::with_capacity(bytes),
            spans: Vec::with_capacity(packets),
            metadata: Vec::with_capacity(packets),
        }
    }

    /// Pair a contiguous payload with one metadata entry per packet.
    ///
    /// Packets without metadata, and bytes that do not form a whole packet,
    /// are dropped with a warning.
    pub fn from_parts(mut payload: Vec<u8>, mut metadata: Vec<CaptureMetadata>) -> Self {
        let split = packet::split(&payload);
        if let Some(err) = split.malformed {
            warn!(%err, "truncating packet batch");
        }
        let mut spans = split.packets;
        if spans.len() != metadata.len() {
            warn!(
                packets = spans.len(),
                metadata = metadata.len(),
                "packet and metadata counts disagree"
            );
            let count = spans.len().min(metadata.len());
            spans.truncate(count);
            metadata.truncate(count);
        }
        payload.truncate(spans.last().map_or(0, |span| span.end));
        Self {
            payload,
            spans,
            metadata,
        }
    }

    pub fn push(&mut self, packet: &[u8], metadata: CaptureMetadata) {
        let start = self.payload.len();
        self.payload.extend_from_slice(packet);
        self.spans.push(start..self.payload.len());
        self.metadata.push(metadata);
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn metadata(&self) -> &[CaptureMetadata] {
        &self.metadata
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &CaptureMetadata)> {
        self.spans
            .iter()
            .map(|span| &self.payload[span.clone()])
            .zip(&self.metadata)
    }

    pub fn clear(&mut self) {
        self.payload.clear();
        self.spans.clear();
        self.metadata.clear();
    }
}
