#![forbid(unsafe_code)]

use crate::{
    capture::{
        CaptureDriver, CaptureError, EventHandle, Handle, OpenFlags, PacketHandle, Param,
        REINJECT_FILTER, ShutdownDirection, intent_filter, packet_filter,
    },
    classifier::{ProcessClassifier, ProcessNames},
    error::Error,
    interceptor::PacketInterceptor,
    interface::{Egress, InterfaceLookup},
    registry::SessionRegistry,
    rules::DomainRules,
    stack::{NetStack, StackFactory},
    watcher::IntentWatcher,
    writer::{CoalescingWriter, StackOutput},
};
use config::{Capture, Config, Server};
use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Collaborators the engine is started with.
pub struct Services {
    pub driver: Box<dyn CaptureDriver>,
    pub interfaces: Box<dyn InterfaceLookup>,
    pub process_names: Box<dyn ProcessNames>,
    pub stacks: StackFactory,
}

/// The three capture handles, opened in priority order.
struct Handles {
    intent: Arc<dyn EventHandle>,
    packets: Arc<dyn PacketHandle>,
    reinject: Arc<dyn PacketHandle>,
}

impl Handles {
    /// Open and tune every handle. On failure, whatever was opened is
    /// released again.
    fn open(
        driver: &dyn CaptureDriver,
        capture: &Capture,
        proxy: Ipv4Addr,
        egress: Egress,
    ) -> Result<Self, Error> {
        let intent = driver.open_socket(
            &intent_filter(proxy),
            capture.priority,
            OpenFlags::SNIFF | OpenFlags::RECV_ONLY,
        )?;
        let packets = match driver.open_network(
            &packet_filter(egress.interface, proxy),
            capture.priority + 1,
            OpenFlags::empty(),
        ) {
            Ok(handle) => handle,
            Err(err) => {
                release("intent", intent.as_ref());
                return Err(err.into());
            }
        };
        let reinject = match driver.open_network(
            REINJECT_FILTER,
            capture.priority + 2,
            OpenFlags::SEND_ONLY,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                release("intent", intent.as_ref());
                release("packet", packets.as_ref());
                return Err(err.into());
            }
        };

        let handles = Self {
            intent,
            packets,
            reinject,
        };
        if let Err(err) = handles.tune(capture) {
            handles.release();
            return Err(err.into());
        }
        Ok(handles)
    }

    fn tune(&self, capture: &Capture) -> Result<(), CaptureError> {
        let params = [
            (Param::QueueLength, capture.queue_length),
            (
                Param::QueueTime,
                capture.queue_time.map(|time| time.as_millis() as u64),
            ),
            (Param::QueueSize, capture.queue_size),
        ];
        for (param, value) in params {
            if let Some(value) = value {
                self.packets.set_param(param, value)?;
                debug!(param = param.name(), value, "tuned packet handle");
            }
        }
        Ok(())
    }

    /// Stop receiving on the capture handles. Pending receives fail once the
    /// driver queue is drained; the reinjection handle stays usable.
    fn stop_capture(&self) {
        shutdown("intent", self.intent.as_ref(), ShutdownDirection::Recv);
        shutdown("packet", self.packets.as_ref(), ShutdownDirection::Recv);
    }

    fn release(&self) {
        shutdown("intent", self.intent.as_ref(), ShutdownDirection::Both);
        shutdown("packet", self.packets.as_ref(), ShutdownDirection::Both);
        shutdown("reinjection", self.reinject.as_ref(), ShutdownDirection::Both);
        close("intent", self.intent.as_ref());
        close("packet", self.packets.as_ref());
        close("reinjection", self.reinject.as_ref());
    }
}

fn shutdown<H: Handle + ?Sized>(name: &str, handle: &H, direction: ShutdownDirection) {
    if let Err(err) = handle.shutdown(direction) {
        warn!(handle = name, ?direction, %err, "failed to shut down capture handle");
    }
}

fn close<H: Handle + ?Sized>(name: &str, handle: &H) {
    if let Err(err) = handle.close() {
        warn!(handle = name, %err, "failed to close capture handle");
    }
}

fn release<H: Handle + ?Sized>(name: &str, handle: &H) {
    shutdown(name, handle, ShutdownDirection::Both);
    close(name, handle);
}

type LoopResult = (&'static str, Result<(), Error>);

/// The running diversion pipeline: intent watcher, packet interceptor and
/// reinjection writer.
pub struct DiversionEngine {
    handles: Handles,
    output: StackOutput,
    stack: Arc<dyn NetStack>,
    registry: Arc<SessionRegistry>,
    egress: Egress,
    loops: JoinSet<LoopResult>,
    cancel: CancellationToken,
}

impl DiversionEngine {
    /// Validate `config`, open the capture handles and spawn the loops.
    ///
    /// Nothing is left open when this fails.
    pub async fn start(config: Config, services: Services) -> Result<Self, Error> {
        config.validate()?;
        let rules = Arc::new(DomainRules::new(&config.diversion.whitelist)?);
        if !services.stacks.supports(config.server.kind) {
            return Err(Error::UnsupportedProxy(config.server.kind));
        }
        let version = services.driver.version()?;
        version.check()?;
        debug!(%version, "capture driver");

        let proxy = resolve_ipv4(&config.server).await?;
        let egress = services.interfaces.best_interface(proxy)?;
        info!(
            %proxy,
            interface = egress.interface,
            subinterface = egress.subinterface,
            "resolved egress interface"
        );

        let handles = Handles::open(services.driver.as_ref(), &config.capture, proxy, egress)?;
        let (writer, output) = CoalescingWriter::new(
            Arc::clone(&handles.reinject),
            egress.interface,
            egress.subinterface,
            config.capture.batch_size,
            config.pipeline.flush_interval,
        );
        let stack: Arc<dyn NetStack> = match services.stacks.build(&config, output.clone()) {
            Ok(stack) => Arc::from(stack),
            Err(err) => {
                handles.release();
                return Err(err);
            }
        };
        info!(kind = %config.server.kind, server = %config.server.endpoint(), "TCP/IP stack ready");

        let registry = Arc::new(SessionRegistry::new());
        let cancel = CancellationToken::new();
        let watcher = IntentWatcher::new(
            Arc::clone(&handles.intent),
            ProcessClassifier::new(services.process_names, &config.diversion.processes),
            Arc::clone(&registry),
            config.capture.batch_size,
            &config.pipeline,
            cancel.clone(),
        );
        let interceptor = PacketInterceptor::new(
            Arc::clone(&handles.packets),
            Arc::clone(&registry),
            rules,
            Arc::clone(&stack),
            config.capture.batch_size,
        );

        let mut loops = JoinSet::new();
        loops.spawn_blocking(move || ("intent watcher", watcher.run()));
        loops.spawn_blocking(move || ("packet interceptor", interceptor.run()));
        loops.spawn_blocking(move || ("reinjection writer", writer.run()));
        info!(
            processes = config.diversion.processes.len(),
            whitelist = config.diversion.whitelist.len(),
            "diversion started"
        );

        Ok(Self {
            handles,
            output,
            stack,
            registry,
            egress,
            loops,
            cancel,
        })
    }

    /// Flows registered so far.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn egress(&self) -> Egress {
        self.egress
    }

    /// Run until `cancel` fires or any loop stops, then tear everything down.
    ///
    /// Returns the first loop failure, if any.
    pub async fn run_until(mut self, cancel: CancellationToken) -> Result<(), Error> {
        let first = tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutdown requested");
                None
            }
            Some(joined) = self.loops.join_next() => Some(joined),
        };
        self.stop(first).await
    }

    async fn stop(mut self, first: Option<Result<LoopResult, JoinError>>) -> Result<(), Error> {
        let mut result = Ok(());
        if let Some(joined) = first {
            record(&mut result, joined);
        }

        self.cancel.cancel();
        self.handles.stop_capture();
        // the writer flushes what the stack already produced, then exits
        self.output.close();
        while let Some(joined) = self.loops.join_next().await {
            record(&mut result, joined);
        }
        self.handles.release();
        if let Err(err) = self.stack.close() {
            warn!(%err, "failed to close TCP/IP stack");
        }
        info!(flows = self.registry.len(), "diversion stopped");
        result
    }
}

fn record(result: &mut Result<(), Error>, joined: Result<LoopResult, JoinError>) {
    let err = match joined {
        Ok((name, Ok(()))) => {
            debug!(name, "loop finished");
            return;
        }
        Ok((name, Err(err))) => {
            error!(name, %err, "loop failed");
            err
        }
        Err(err) => {
            error!(%err, "loop panicked");
            err.into()
        }
    };
    if result.is_ok() {
        *result = Err(err);
    }
}

/// IPv4 address of the proxy server. Host names are resolved.
async fn resolve_ipv4(server: &Server) -> Result<Ipv4Addr, Error> {
    if let Ok(ip) = server.server.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let unresolvable = || Error::Unresolvable(server.server.clone());
    let addrs = tokio::net::lookup_host((server.server.as_str(), server.server_port))
        .await
        .map_err(|err| {
            debug!(%err, server = %server.server, "lookup failed");
            unresolvable()
        })?;
    addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(unresolvable)
}
