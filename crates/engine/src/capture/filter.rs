#![forbid(unsafe_code)]

//! Filter expressions understood by the capture driver.
//!
//! The strings must stay byte-for-byte identical to what the driver is known
//! to accept.

use std::net::Ipv4Addr;

/// Send-only handle: captures nothing.
pub const REINJECT_FILTER: &str = "false";

/// Outbound CONNECT events, excluding the proxy server itself.
pub fn intent_filter(proxy: Ipv4Addr) -> String {
    format!(
        "outbound and !loopback and !ipv6 and (tcp or udp) and event == CONNECT and remoteAddr != {proxy}"
    )
}

/// Outbound packets leaving through `interface`, excluding the proxy server.
pub fn packet_filter(interface: u32, proxy: Ipv4Addr) -> String {
    format!(
        "ifIdx == {interface} and outbound and !loopback and !ipv6 and (tcp or udp) and remoteAddr != {proxy}"
    )
}
