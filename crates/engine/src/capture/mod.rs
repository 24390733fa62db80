//! Seam towards the kernel packet-filter driver.
//!
//! The engine only ever sees decoded values ([`SocketEvent`],
//! [`CaptureMetadata`], [`PacketBatch`]). Fixed-layout driver structures stay
//! inside the platform binding.

mod filter;
mod metadata;
#[cfg(windows)]
mod windivert;

pub use filter::{REINJECT_FILTER, intent_filter, packet_filter};
pub use metadata::{CaptureMetadata, MetaFlags, PacketBatch, SocketEvent, SocketEventKind};
#[cfg(windows)]
pub use windivert::WinDivertDriver;

use bitflags::bitflags;
use std::{fmt, io, ops::RangeInclusive, sync::Arc};

/// Driver layers used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// Raw IP packets.
    Network,
    /// Socket operations, no payload.
    Socket,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u64 {
        const SNIFF = 0x0001;
        const DROP = 0x0002;
        const RECV_ONLY = 0x0004;
        const SEND_ONLY = 0x0008;
        const NO_INSTALL = 0x0010;
        const FRAGMENTS = 0x0020;
    }
}

/// Driver queue parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    QueueLength,
    /// Milliseconds.
    QueueTime,
    /// Bytes.
    QueueSize,
}

impl Param {
    pub fn name(self) -> &'static str {
        match self {
            Self::QueueLength => "queue_length",
            Self::QueueTime => "queue_time",
            Self::QueueSize => "queue_size",
        }
    }

    pub fn range(self) -> RangeInclusive<u64> {
        match self {
            Self::QueueLength => config::QUEUE_LENGTH_RANGE,
            Self::QueueTime => config::QUEUE_TIME_RANGE,
            Self::QueueSize => config::QUEUE_SIZE_RANGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDirection {
    Recv,
    Send,
    Both,
}

/// Version reported by the packet-filter driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DriverVersion {
    pub major: u64,
    pub minor: u64,
}

/// Driver releases the binding works with.
pub const SUPPORTED_VERSIONS: RangeInclusive<DriverVersion> =
    DriverVersion::new(2, 0)..=DriverVersion::new(2, 2);

impl DriverVersion {
    pub const fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    pub fn check(self) -> Result<(), CaptureError> {
        if SUPPORTED_VERSIONS.contains(&self) {
            Ok(())
        } else {
            Err(CaptureError::UnsupportedVersion(self))
        }
    }
}

impl fmt::Display for DriverVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The packet could not be routed. Expected under normal network churn.
    #[error("host unreachable")]
    HostUnreachable,

    /// The handle was shut down or closed while the call was pending.
    #[error("capture handle has been shut down")]
    Shutdown,

    #[error("invalid filter `{filter}`: {reason}")]
    Filter { filter: String, reason: String },

    #[error("invalid open flags {0:?}")]
    Flags(OpenFlags),

    #[error("priority {0} is outside {min}..={max}", min = config::PRIORITY_RANGE.start(), max = config::PRIORITY_RANGE.end())]
    Priority(i16),

    #[error("{param} = {value} is out of range {min}..={max}", param = .0.name(), min = .0.range().start(), max = .0.range().end(), value = .1)]
    ParamRange(Param, u64),

    #[error("unsupported driver version {0}, expected {min} to {max}", min = SUPPORTED_VERSIONS.start(), max = SUPPORTED_VERSIONS.end())]
    UnsupportedVersion(DriverVersion),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CaptureError {
    /// Errors after which a loop must not keep using the handle.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::HostUnreachable)
    }
}

/// Reject invalid priority and flag combinations before calling the driver.
pub fn check_open(priority: i16, flags: OpenFlags) -> Result<(), CaptureError> {
    if !config::PRIORITY_RANGE.contains(&priority) {
        return Err(CaptureError::Priority(priority));
    }
    let exclusive = [
        OpenFlags::SNIFF | OpenFlags::DROP,
        OpenFlags::RECV_ONLY | OpenFlags::SEND_ONLY,
    ];
    if exclusive.iter().any(|pair| flags.contains(*pair)) {
        return Err(CaptureError::Flags(flags));
    }
    Ok(())
}

/// Reject out-of-range queue parameters. Values are never clamped.
pub fn check_param(param: Param, value: u64) -> Result<(), CaptureError> {
    if param.range().contains(&value) {
        Ok(())
    } else {
        Err(CaptureError::ParamRange(param, value))
    }
}

/// Opens handles on the packet-filter driver.
pub trait CaptureDriver: Send + Sync {
    /// Version of the installed driver.
    fn version(&self) -> Result<DriverVersion, CaptureError>;

    /// Open a [`Layer::Network`] handle.
    fn open_network(
        &self,
        filter: &str,
        priority: i16,
        flags: OpenFlags,
    ) -> Result<Arc<dyn PacketHandle>, CaptureError>;

    /// Open a [`Layer::Socket`] handle.
    fn open_socket(
        &self,
        filter: &str,
        priority: i16,
        flags: OpenFlags,
    ) -> Result<Arc<dyn EventHandle>, CaptureError>;
}

/// Lifecycle shared by every handle.
///
/// `shutdown` may be called while another thread is blocked in a receive on
/// the same handle; the receive then fails with [`CaptureError::Shutdown`].
pub trait Handle: Send + Sync {
    fn shutdown(&self, direction: ShutdownDirection) -> Result<(), CaptureError>;

    fn close(&self) -> Result<(), CaptureError>;
}

/// A network-layer handle.
pub trait PacketHandle: Handle {
    /// Block until at least one packet is available, returning up to `max`.
    fn recv_packets(&self, max: usize) -> Result<PacketBatch, CaptureError>;

    /// Send every packet of `payload`, one metadata entry per packet.
    fn send_packets(
        &self,
        payload: &[u8],
        metadata: &[CaptureMetadata],
    ) -> Result<usize, CaptureError>;

    fn set_param(&self, param: Param, value: u64) -> Result<(), CaptureError>;
}

/// A socket-layer handle.
pub trait EventHandle: Handle {
    /// Block until at least one event is available, returning up to `max`.
    fn recv_events(&self, max: usize) -> Result<Vec<SocketEvent>, CaptureError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_flags_are_rejected() {
        assert!(check_open(0, OpenFlags::SNIFF | OpenFlags::RECV_ONLY).is_ok());
        assert!(matches!(
            check_open(0, OpenFlags::SNIFF | OpenFlags::DROP),
            Err(CaptureError::Flags(_))
        ));
        assert!(matches!(
            check_open(0, OpenFlags::RECV_ONLY | OpenFlags::SEND_ONLY),
            Err(CaptureError::Flags(_))
        ));
        assert!(matches!(
            check_open(30001, OpenFlags::empty()),
            Err(CaptureError::Priority(30001))
        ));
    }

    #[test]
    fn params_are_not_clamped() {
        assert!(check_param(Param::QueueTime, 100).is_ok());
        let err = check_param(Param::QueueTime, 99).unwrap_err();
        assert_eq!(err.to_string(), "queue_time = 99 is out of range 100..=16000");
        assert!(check_param(Param::QueueSize, 33554433).is_err());
    }

    #[test]
    fn driver_versions_outside_2_0_to_2_2_are_rejected() {
        for (major, minor) in [(2, 0), (2, 1), (2, 2)] {
            assert!(DriverVersion::new(major, minor).check().is_ok());
        }
        for (major, minor) in [(1, 4), (2, 3), (3, 0)] {
            assert!(matches!(
                DriverVersion::new(major, minor).check(),
                Err(CaptureError::UnsupportedVersion(v)) if v == DriverVersion::new(major, minor)
            ));
        }
        assert_eq!(
            CaptureError::UnsupportedVersion(DriverVersion::new(1, 4)).to_string(),
            "unsupported driver version 1.4, expected 2.0 to 2.2"
        );
    }

    #[test]
    fn only_host_unreachable_is_tolerated() {
        assert!(!CaptureError::HostUnreachable.is_fatal());
        assert!(CaptureError::Shutdown.is_fatal());
    }
}
