//! Egress interface lookup.

use crate::error::Error;
use std::net::Ipv4Addr;

/// Interface the proxy server is reached through.
///
/// Only that interface is captured, and stack output is injected on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Egress {
    pub interface: u32,
    pub subinterface: u32,
}

pub trait InterfaceLookup: Send + Sync {
    fn best_interface(&self, destination: Ipv4Addr) -> Result<Egress, Error>;
}

/// [`InterfaceLookup`] backed by the system routing table.
#[cfg(windows)]
#[derive(Debug, Default)]
pub struct RoutingTable;

#[cfg(windows)]
impl InterfaceLookup for RoutingTable {
    fn best_interface(&self, destination: Ipv4Addr) -> Result<Egress, Error> {
        use std::mem;
        use windows::Win32::{
            NetworkManagement::IpHelper::GetBestInterfaceEx,
            Networking::WinSock::{AF_INET, SOCKADDR, SOCKADDR_IN},
        };

        // SAFETY: SOCKADDR_IN is plain old data.
        let mut addr: SOCKADDR_IN = unsafe { mem::zeroed() };
        addr.sin_family = AF_INET;
        addr.sin_addr.S_un.S_addr = u32::from_ne_bytes(destination.octets());

        let mut index = 0u32;
        let rc = unsafe {
            GetBestInterfaceEx(
                &addr as *const SOCKADDR_IN as *const SOCKADDR,
                &mut index,
            )
        };
        if rc != 0 {
            tracing::warn!(%destination, rc, "GetBestInterfaceEx failed");
            return Err(Error::NoInterface(destination));
        }
        Ok(Egress {
            interface: index,
            subinterface: 0,
        })
    }
}
