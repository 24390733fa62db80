#![forbid(unsafe_code)]

use std::{fmt, net::SocketAddrV4};

/// Transport protocols that can be diverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Protocol {
    Tcp = 6,
    Udp = 17,
}

impl Protocol {
    /// Map an IP protocol number. Anything but TCP and UDP is `None`.
    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        self as u8
    }
}

/// Identity of one connection as seen from this host.
///
/// Built from CONNECT events (local/remote endpoints) and from outbound
/// packets (source/destination), so both paths agree on the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub protocol: Protocol,
}

impl FlowKey {
    pub fn new(local: SocketAddrV4, remote: SocketAddrV4, protocol: Protocol) -> Self {
        Self {
            local,
            remote,
            protocol,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}=>{}#{}",
            self.local,
            self.remote,
            self.protocol.number()
        )
    }
}
