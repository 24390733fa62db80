#![forbid(unsafe_code)]

//! UDP bridge to an external TCP/IP stack process.
//!
//! Every diverted packet is sent as one datagram to the stack process; every
//! datagram it sends back is a packet for the local host and goes to the
//! reinjection writer.

use config::Bridge;
use engine::{Error, NetStack, StackOutput};
use std::{io, net::UdpSocket};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Largest datagram accepted from the stack process.
const MAX_DATAGRAM: usize = 0xffff;

pub struct UdpBridgeStack {
    socket: UdpSocket,
    cancel: CancellationToken,
}

impl UdpBridgeStack {
    /// Bind `bridge.bind`, connect to `bridge.stack` and start forwarding
    /// replies into `output`. Must be called inside a tokio runtime.
    pub fn connect(bridge: &Bridge, output: StackOutput) -> Result<Self, Error> {
        let runtime =
            Handle::try_current().map_err(|err| Error::Stack(format!("no async runtime: {err}")))?;

        let socket = UdpSocket::bind(bridge.bind)?;
        socket.connect(bridge.stack)?;
        socket.set_nonblocking(true)?;
        let replies = {
            let _guard = runtime.enter();
            tokio::net::UdpSocket::from_std(socket.try_clone()?)?
        };

        let cancel = CancellationToken::new();
        runtime.spawn(forward_replies(replies, output, cancel.clone()));
        info!(local = %socket.local_addr()?, stack = %bridge.stack, "bridge connected");

        Ok(Self { socket, cancel })
    }
}

impl NetStack for UdpBridgeStack {
    fn input(&self, packet: &[u8]) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Stack("bridge is closed".into()));
        }
        match self.socket.send(packet) {
            Ok(_) => Ok(()),
            // The stack process is busy or not listening yet; TCP retransmits.
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionRefused
                ) =>
            {
                trace!(%err, len = packet.len(), "dropped diverted packet");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn close(&self) -> Result<(), Error> {
        self.cancel.cancel();
        Ok(())
    }
}

impl Drop for UdpBridgeStack {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn forward_replies(
    socket: tokio::net::UdpSocket,
    output: StackOutput,
    cancel: CancellationToken,
) {
    let mut buf = vec![0; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv(&mut buf) => received,
        };
        match received {
            Ok(len) => {
                if let Err(err) = output.write(&buf[..len]) {
                    debug!(%err, "reinjection writer gone");
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                ) =>
            {
                trace!(%err, "stack process not reachable");
            }
            Err(err) => {
                warn!(%err, "bridge receive failed");
                break;
            }
        }
    }
    debug!("bridge reply forwarding stopped");
}
