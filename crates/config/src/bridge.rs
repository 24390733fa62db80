#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// UDP link to the external TCP/IP stack process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Bridge {
    /// Local address the bridge socket binds to.
    pub bind: SocketAddr,

    /// Where diverted packets are sent, one IP packet per datagram.
    pub stack: SocketAddr,
}

impl Default for Bridge {
    fn default() -> Self {
        Self {
            bind: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0).into(),
            stack: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7301).into(),
        }
    }
}
