use crate::error::Error;
use engine::Services;

/// Production collaborators: WinDivert capture, the routing table, sysinfo
/// process names and the bridged stacks.
#[cfg(windows)]
pub fn system() -> Result<Services, Error> {
    use engine::{RoutingTable, SystemProcessNames, capture::WinDivertDriver};

    Ok(Services {
        driver: Box::new(WinDivertDriver),
        interfaces: Box::new(RoutingTable),
        process_names: Box::new(SystemProcessNames::new()),
        stacks: crate::stacks::factory(),
    })
}

#[cfg(not(windows))]
pub fn system() -> Result<Services, Error> {
    Err(Error::UnsupportedPlatform)
}
