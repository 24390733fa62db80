//! WinDivert binding.
//!
//! Everything leaving this module is a decoded [`SocketEvent`] or
//! [`CaptureMetadata`].

use super::{
    CaptureDriver, CaptureError, CaptureMetadata, DriverVersion, EventHandle, Handle, MetaFlags,
    OpenFlags, PacketBatch, PacketHandle, Param, ShutdownDirection, SocketEvent, SocketEventKind,
    check_open, check_param,
};
use parking_lot::Mutex;
use std::{
    borrow::Cow,
    io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};
use tracing::{debug, trace};
use windivert::{
    CloseAction, address::WinDivertAddress, error::WinDivertError, layer::WinDivertLayerTrait,
    prelude::*,
};

/// Largest packet the driver hands out.
const MTU_MAX: usize = 40 + 0xffff;

/// Upper bound of one driver wait, so shutdown and close get the handle back.
const RECV_WAIT_MS: u32 = 100;

const ERROR_INVALID_PARAMETER: i32 = 87;
const ERROR_NO_DATA: i32 = 232;
const ERROR_OPERATION_ABORTED: i32 = 995;
const ERROR_HOST_UNREACHABLE: i32 = 1232;

/// [`CaptureDriver`] backed by the WinDivert 2.x driver.
#[derive(Debug, Default)]
pub struct WinDivertDriver;

impl CaptureDriver for WinDivertDriver {
    fn version(&self) -> Result<DriverVersion, CaptureError> {
        let mut divert = WinDivert::network("false", 0, WinDivertFlags::new().set_send_only())
            .map_err(|err| open_error("false", err))?;
        let version = divert
            .get_param(WinDivertParam::VersionMajor)
            .and_then(|major| {
                let minor = divert.get_param(WinDivertParam::VersionMinor)?;
                Ok(DriverVersion::new(major, minor))
            })
            .map_err(driver_error);
        if let Err(err) = divert.close(CloseAction::Nothing) {
            debug!(?err, "failed to close version query handle");
        }
        version
    }

    fn open_network(
        &self,
        filter: &str,
        priority: i16,
        flags: OpenFlags,
    ) -> Result<Arc<dyn PacketHandle>, CaptureError> {
        check_open(priority, flags)?;
        let divert = WinDivert::network(filter, priority, to_divert_flags(flags))
            .map_err(|err| open_error(filter, err))?;
        debug!(filter, priority, ?flags, "opened network handle");
        Ok(Arc::new(NetworkHandle {
            shared: Shared::new(divert),
            buffer: Mutex::new(Vec::new()),
        }))
    }

    fn open_socket(
        &self,
        filter: &str,
        priority: i16,
        flags: OpenFlags,
    ) -> Result<Arc<dyn EventHandle>, CaptureError> {
        check_open(priority, flags)?;
        let divert = WinDivert::socket(filter, priority, to_divert_flags(flags))
            .map_err(|err| open_error(filter, err))?;
        debug!(filter, priority, ?flags, "opened socket handle");
        Ok(Arc::new(SocketHandle {
            shared: Shared::new(divert),
        }))
    }
}

fn to_divert_flags(flags: OpenFlags) -> WinDivertFlags {
    let mut divert = WinDivertFlags::new();
    if flags.contains(OpenFlags::SNIFF) {
        divert = divert.set_sniff();
    }
    if flags.contains(OpenFlags::DROP) {
        divert = divert.set_drop();
    }
    if flags.contains(OpenFlags::RECV_ONLY) {
        divert = divert.set_recv_only();
    }
    if flags.contains(OpenFlags::SEND_ONLY) {
        divert = divert.set_send_only();
    }
    if flags.contains(OpenFlags::NO_INSTALL) {
        divert = divert.set_no_installs();
    }
    if flags.contains(OpenFlags::FRAGMENTS) {
        divert = divert.set_fragments();
    }
    divert
}

fn open_error(filter: &str, err: WinDivertError) -> CaptureError {
    match io::Error::last_os_error().raw_os_error() {
        Some(ERROR_INVALID_PARAMETER) => CaptureError::Filter {
            filter: filter.to_owned(),
            reason: err.to_string(),
        },
        _ => CaptureError::Io(io::Error::other(err)),
    }
}

/// The binding leaves the Win32 code of the failed call in place; it tells
/// routing failures and shutdown apart from real faults.
fn driver_error(err: WinDivertError) -> CaptureError {
    match io::Error::last_os_error().raw_os_error() {
        Some(ERROR_HOST_UNREACHABLE) => CaptureError::HostUnreachable,
        Some(ERROR_NO_DATA | ERROR_OPERATION_ABORTED) => CaptureError::Shutdown,
        _ => CaptureError::Io(io::Error::other(err)),
    }
}

struct Divert<L: WinDivertLayerTrait>(WinDivert<L>);

// SAFETY: a WinDivert handle may be used from any thread; access is
// serialized by the surrounding mutex.
unsafe impl<L: WinDivertLayerTrait> Send for Divert<L> {}

/// A handle shared between the loop that receives on it and the supervisor
/// that shuts it down.
struct Shared<L: WinDivertLayerTrait> {
    divert: Mutex<Option<Divert<L>>>,
    recv_stopped: AtomicBool,
}

impl<L: WinDivertLayerTrait> Shared<L> {
    fn new(divert: WinDivert<L>) -> Self {
        Self {
            divert: Mutex::new(Some(Divert(divert))),
            recv_stopped: AtomicBool::new(false),
        }
    }

    fn with<T>(
        &self,
        call: impl FnOnce(&mut WinDivert<L>) -> Result<T, WinDivertError>,
    ) -> Result<T, CaptureError> {
        let mut divert = self.divert.lock();
        let divert = divert.as_mut().ok_or(CaptureError::Shutdown)?;
        call(&mut divert.0).map_err(driver_error)
    }

    /// Repeat bounded waits until `attempt` yields something. Once receiving
    /// is shut down, an empty wait ends with [`CaptureError::Shutdown`].
    fn recv<T>(
        &self,
        mut attempt: impl FnMut(&mut WinDivert<L>) -> Result<Option<T>, WinDivertError>,
    ) -> Result<T, CaptureError> {
        loop {
            match self.with(|divert| match attempt(divert) {
                Err(WinDivertError::Timeout) => Ok(None),
                other => other,
            }) {
                Ok(Some(received)) => return Ok(received),
                Ok(None) if self.recv_stopped.load(Ordering::Acquire) => {
                    return Err(CaptureError::Shutdown);
                }
                Ok(None) => continue,
                Err(_) if self.recv_stopped.load(Ordering::Acquire) => {
                    return Err(CaptureError::Shutdown);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn shutdown(&self, direction: ShutdownDirection) -> Result<(), CaptureError> {
        let mode = match direction {
            ShutdownDirection::Recv => WinDivertShutdownMode::Recv,
            ShutdownDirection::Send => WinDivertShutdownMode::Send,
            ShutdownDirection::Both => WinDivertShutdownMode::Both,
        };
        if direction != ShutdownDirection::Send {
            self.recv_stopped.store(true, Ordering::Release);
        }
        match self.with(|divert| divert.shutdown(mode)) {
            Err(CaptureError::Shutdown) => Ok(()),
            other => other,
        }
    }

    fn close(&self) -> Result<(), CaptureError> {
        self.recv_stopped.store(true, Ordering::Release);
        let Some(mut divert) = self.divert.lock().take() else {
            return Ok(());
        };
        divert
            .0
            .close(CloseAction::Nothing)
            .map_err(|err| CaptureError::Io(io::Error::other(err)))?;
        trace!("closed WinDivert handle");
        Ok(())
    }
}

impl<L: WinDivertLayerTrait> Drop for Shared<L> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct NetworkHandle {
    shared: Shared<NetworkLayer>,
    buffer: Mutex<Vec<u8>>,
}

impl Handle for NetworkHandle {
    fn shutdown(&self, direction: ShutdownDirection) -> Result<(), CaptureError> {
        self.shared.shutdown(direction)
    }

    fn close(&self) -> Result<(), CaptureError> {
        self.shared.close()
    }
}

impl PacketHandle for NetworkHandle {
    fn recv_packets(&self, max: usize) -> Result<PacketBatch, CaptureError> {
        let max = max.clamp(1, config::MAX_BATCH);
        let mut buffer = self.buffer.lock();
        buffer.resize(max * MTU_MAX, 0);

        self.shared.recv(|divert| {
            let packets = divert.recv_wait_ex(Some(&mut buffer[..]), max as _, RECV_WAIT_MS)?;
            if packets.is_empty() {
                return Ok(None);
            }
            let bytes = packets.iter().map(|packet| packet.data.len()).sum();
            let mut batch = PacketBatch::with_capacity(packets.len(), bytes);
            for packet in &packets {
                batch.push(&packet.data, decode_network(&packet.address));
            }
            Ok(Some(batch))
        })
    }

    fn send_packets(
        &self,
        payload: &[u8],
        metadata: &[CaptureMetadata],
    ) -> Result<usize, CaptureError> {
        if metadata.is_empty() {
            return Ok(0);
        }
        let batch = PacketBatch::from_parts(payload.to_vec(), metadata.to_vec());
        let template = blank_address();
        let packets: Vec<WinDivertPacket<'_, NetworkLayer>> = batch
            .iter()
            .map(|(data, meta)| WinDivertPacket {
                address: encode_network(template.clone(), meta),
                data: Cow::Borrowed(data),
            })
            .collect();
        let sent = self.shared.with(|divert| divert.send_ex(&packets))?;
        Ok(sent as usize)
    }

    fn set_param(&self, param: Param, value: u64) -> Result<(), CaptureError> {
        check_param(param, value)?;
        let param = match param {
            Param::QueueLength => WinDivertParam::QueueLength,
            Param::QueueTime => WinDivertParam::QueueTime,
            Param::QueueSize => WinDivertParam::QueueSize,
        };
        self.shared.with(|divert| divert.set_param(param, value))
    }
}

struct SocketHandle {
    shared: Shared<SocketLayer>,
}

impl Handle for SocketHandle {
    fn shutdown(&self, direction: ShutdownDirection) -> Result<(), CaptureError> {
        self.shared.shutdown(direction)
    }

    fn close(&self) -> Result<(), CaptureError> {
        self.shared.close()
    }
}

impl EventHandle for SocketHandle {
    fn recv_events(&self, max: usize) -> Result<Vec<SocketEvent>, CaptureError> {
        let max = max.clamp(1, config::MAX_BATCH);
        self.shared.recv(|divert| {
            let events = divert.recv_wait_ex(max as _, RECV_WAIT_MS)?;
            if events.is_empty() {
                return Ok(None);
            }
            Ok(Some(
                events
                    .iter()
                    .filter_map(|event| decode_socket(&event.address))
                    .collect(),
            ))
        })
    }
}

fn blank_address() -> WinDivertAddress<NetworkLayer> {
    // SAFETY: every address field the driver reads on send is set by
    // `encode_network`.
    unsafe { WinDivertPacket::<NetworkLayer>::new(Vec::new()) }.address
}

fn decode_network(address: &WinDivertAddress<NetworkLayer>) -> CaptureMetadata {
    let mut flags = MetaFlags::empty();
    flags.set(MetaFlags::SNIFFED, address.sniffed());
    flags.set(MetaFlags::OUTBOUND, address.outbound());
    flags.set(MetaFlags::LOOPBACK, address.loopback());
    flags.set(MetaFlags::IMPOSTOR, address.impostor());
    flags.set(MetaFlags::IPV6, address.ipv6());
    flags.set(MetaFlags::IP_CHECKSUM, address.ip_checksum());
    flags.set(MetaFlags::TCP_CHECKSUM, address.tcp_checksum());
    flags.set(MetaFlags::UDP_CHECKSUM, address.udp_checksum());
    CaptureMetadata {
        timestamp: 0,
        interface: address.interface_index(),
        subinterface: address.subinterface_index(),
        flags,
    }
}

fn encode_network(
    mut address: WinDivertAddress<NetworkLayer>,
    meta: &CaptureMetadata,
) -> WinDivertAddress<NetworkLayer> {
    address.set_interface_index(meta.interface);
    address.set_subinterface_index(meta.subinterface);
    address.set_outbound(meta.flags.contains(MetaFlags::OUTBOUND));
    address.set_impostor(meta.flags.contains(MetaFlags::IMPOSTOR));
    address.set_ipv6(meta.flags.contains(MetaFlags::IPV6));
    address.set_ip_checksum(meta.flags.contains(MetaFlags::IP_CHECKSUM));
    address.set_tcp_checksum(meta.flags.contains(MetaFlags::TCP_CHECKSUM));
    address.set_udp_checksum(meta.flags.contains(MetaFlags::UDP_CHECKSUM));
    address
}

fn decode_socket(address: &WinDivertAddress<SocketLayer>) -> Option<SocketEvent> {
    let kind = match address.event() {
        WinDivertEvent::SocketBind => SocketEventKind::Bind,
        WinDivertEvent::SocketConnect => SocketEventKind::Connect,
        WinDivertEvent::SocketListen => SocketEventKind::Listen,
        WinDivertEvent::SocketAccept => SocketEventKind::Accept,
        WinDivertEvent::SocketClose => SocketEventKind::Close,
        _ => return None,
    };
    Some(SocketEvent {
        kind,
        pid: address.process_id(),
        local: SocketAddr::from((address.local_address(), address.local_port())),
        remote: SocketAddr::from((address.remote_address(), address.remote_port())),
        protocol: address.protocol(),
    })
}
