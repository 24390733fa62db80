#![forbid(unsafe_code)]

//! Reinjection of packets produced by the TCP/IP stack.
//!
//! The stack writes raw bytes through [`StackOutput`]. Writes are appended to
//! a shared buffer and wake the writer loop through a single-slot channel;
//! the loop cuts the buffer into packets and sends them in batches bounded by
//! count and time.

use crate::{
    capture::{CaptureError, CaptureMetadata, MetaFlags, PacketBatch, PacketHandle},
    error::Error,
    packet,
};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
struct Pending {
    bytes: Vec<u8>,
    closed: bool,
}

/// Producer side of a [`CoalescingWriter`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StackOutput {
    pending: Arc<Mutex<Pending>>,
    wake: flume::Sender<()>,
}

impl StackOutput {
    /// Queue one or more serialized IP packets. A packet may be split across
    /// writes.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, Error> {
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(Error::WriterClosed);
            }
            pending.bytes.extend_from_slice(bytes);
        }
        // a full slot already guarantees a wake-up
        let _ = self.wake.try_send(());
        Ok(bytes.len())
    }

    /// Stop accepting writes. The writer flushes what is queued and exits.
    pub fn close(&self) {
        self.pending.lock().closed = true;
        let _ = self.wake.try_send(());
    }
}

/// Batches stack output into reinjection sends.
pub struct CoalescingWriter {
    handle: Arc<dyn PacketHandle>,
    pending: Arc<Mutex<Pending>>,
    wake: flume::Receiver<()>,
    metadata: CaptureMetadata,
    batch_size: usize,
    flush_interval: Duration,
}

impl CoalescingWriter {
    /// Packets are reinjected on `interface`/`subinterface` through `handle`.
    ///
    /// A `batch_size` of 1 sends every packet on its own.
    pub fn new(
        handle: Arc<dyn PacketHandle>,
        interface: u32,
        subinterface: u32,
        batch_size: usize,
        flush_interval: Duration,
    ) -> (Self, StackOutput) {
        let pending = Arc::new(Mutex::new(Pending::default()));
        let (tx, rx) = flume::bounded(1);
        let writer = Self {
            handle,
            pending: Arc::clone(&pending),
            wake: rx,
            metadata: CaptureMetadata::reinjection(interface, subinterface),
            batch_size: batch_size.clamp(1, config::MAX_BATCH),
            flush_interval,
        };
        (writer, StackOutput { pending, wake: tx })
    }

    /// Run until the output is closed or a send fails fatally. Blocking.
    pub fn run(self) -> Result<(), Error> {
        debug!(
            batch_size = self.batch_size,
            flush_interval = ?self.flush_interval,
            "reinjection writer started"
        );
        let mut batch = PacketBatch::with_capacity(self.batch_size, self.batch_size * 1500);
        let mut deadline = None;

        loop {
            let closed = self.collect(&mut batch, &mut deadline)?;
            if closed {
                self.flush(&mut batch)?;
                debug!("reinjection writer closed");
                return Ok(());
            }

            let woken = match deadline {
                Some(at) => self.wake.recv_deadline(at).map_err(|err| match err {
                    flume::RecvTimeoutError::Timeout => Wake::Timeout,
                    flume::RecvTimeoutError::Disconnected => Wake::Disconnected,
                }),
                None => self.wake.recv().map_err(|_| Wake::Disconnected),
            };
            match woken {
                Ok(()) => {}
                Err(Wake::Timeout) => {
                    self.flush(&mut batch)?;
                    deadline = None;
                }
                Err(Wake::Disconnected) => {
                    self.collect(&mut batch, &mut deadline)?;
                    self.flush(&mut batch)?;
                    debug!("all stack outputs dropped");
                    return Ok(());
                }
            }
        }
    }

    /// Move every complete packet from the shared buffer into `batch`,
    /// sending full batches on the way. Returns whether the output is closed.
    fn collect(
        &self,
        batch: &mut PacketBatch,
        deadline: &mut Option<Instant>,
    ) -> Result<bool, Error> {
        let (bytes, spans, closed) = {
            let mut pending = self.pending.lock();
            let split = packet::split(&pending.bytes);
            let bytes = if let Some(err) = split.malformed {
                warn!(
                    %err,
                    discarded = pending.bytes.len() - split.consumed,
                    "discarding stack output"
                );
                let mut bytes = std::mem::take(&mut pending.bytes);
                bytes.truncate(split.consumed);
                bytes
            } else {
                pending.bytes.drain(..split.consumed).collect()
            };
            (bytes, split.packets, pending.closed)
        };

        for span in spans {
            let packet = &bytes[span];
            let mut metadata = self.metadata;
            if packet[0] >> 4 == 6 {
                metadata.flags |= MetaFlags::IPV6;
            }
            batch.push(packet, metadata);
            deadline.get_or_insert_with(|| Instant::now() + self.flush_interval);
            if batch.len() >= self.batch_size {
                self.flush(batch)?;
                *deadline = None;
            }
        }
        Ok(closed)
    }

    fn flush(&self, batch: &mut PacketBatch) -> Result<(), Error> {
        if batch.is_empty() {
            return Ok(());
        }
        match self.handle.send_packets(batch.payload(), batch.metadata()) {
            Ok(sent) => trace!(packets = batch.len(), bytes = sent, "reinjected"),
            Err(CaptureError::HostUnreachable) => {
                debug!(packets = batch.len(), "reinjection hit an unreachable host")
            }
            Err(err) => {
                batch.clear();
                return Err(err.into());
            }
        }
        batch.clear();
        Ok(())
    }
}

enum Wake {
    Timeout,
    Disconnected,
}
