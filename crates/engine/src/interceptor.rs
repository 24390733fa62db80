#![forbid(unsafe_code)]

use crate::{
    capture::{CaptureError, PacketBatch, PacketHandle},
    error::Error,
    packet,
    registry::SessionRegistry,
    rules::DomainRules,
    stack::NetStack,
};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What happens to one captured packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Hand to the TCP/IP stack.
    Divert,
    /// Reinject unchanged.
    Pass,
}

/// Reads outbound packets and splits them between the stack and the wire.
pub struct PacketInterceptor {
    handle: Arc<dyn PacketHandle>,
    registry: Arc<SessionRegistry>,
    rules: Arc<DomainRules>,
    stack: Arc<dyn NetStack>,
    batch_size: usize,
}

impl PacketInterceptor {
    pub fn new(
        handle: Arc<dyn PacketHandle>,
        registry: Arc<SessionRegistry>,
        rules: Arc<DomainRules>,
        stack: Arc<dyn NetStack>,
        batch_size: usize,
    ) -> Self {
        Self {
            handle,
            registry,
            rules,
            stack,
            batch_size: batch_size.clamp(1, config::MAX_BATCH),
        }
    }

    /// Registered flows are diverted, and so are DNS questions for a
    /// whitelisted domain. Domain decisions are not remembered.
    pub fn verdict(&self, packet: &[u8]) -> Verdict {
        let Some(parsed) = packet::parse(packet) else {
            return Verdict::Pass;
        };
        if self.registry.contains(&parsed.key) {
            return Verdict::Divert;
        }
        if !self.rules.is_empty()
            && let Some(domain) = parsed.dns.and_then(packet::dns_question)
            && self.rules.matches_domain(&domain)
        {
            debug!(flow = %parsed.key, domain = %domain, "diverting DNS question");
            return Verdict::Divert;
        }
        Verdict::Pass
    }

    /// Run until the handle is shut down or fails. Blocking.
    pub fn run(self) -> Result<(), Error> {
        let span = tracing::debug_span!("packet_interceptor");
        let _enter = span.enter();

        let mut passthrough = PacketBatch::with_capacity(self.batch_size, self.batch_size * 1500);
        loop {
            let batch = match self.handle.recv_packets(self.batch_size) {
                Ok(batch) => batch,
                Err(CaptureError::Shutdown) => {
                    debug!("packet handle shut down");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            self.process(&batch, &mut passthrough)?;
        }
    }

    fn process(&self, batch: &PacketBatch, passthrough: &mut PacketBatch) -> Result<(), Error> {
        let verdicts: Vec<Verdict> = batch.iter().map(|(packet, _)| self.verdict(packet)).collect();
        if verdicts.iter().all(|v| *v == Verdict::Pass) {
            return self.reinject(batch);
        }

        passthrough.clear();
        for ((packet, metadata), verdict) in batch.iter().zip(verdicts) {
            match verdict {
                Verdict::Divert => {
                    if let Err(err) = self.stack.input(packet) {
                        warn!(%err, "TCP/IP stack dropped a diverted packet");
                    }
                }
                Verdict::Pass => passthrough.push(packet, *metadata),
            }
        }
        self.reinject(passthrough)
    }

    fn reinject(&self, batch: &PacketBatch) -> Result<(), Error> {
        if batch.is_empty() {
            return Ok(());
        }
        match self.handle.send_packets(batch.payload(), batch.metadata()) {
            Ok(sent) => {
                trace!(packets = batch.len(), bytes = sent, "passed through");
                Ok(())
            }
            Err(CaptureError::HostUnreachable) => {
                debug!(packets = batch.len(), "passthrough hit an unreachable host");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}
