use config::{Config, IntentErrorPolicy, ProxyKind};
use engine::{
    DiversionEngine, Egress, Error, InterfaceLookup, NetStack, ProcessNames, Services,
    StackFactory, StackOutput,
    capture::{
        CaptureDriver, CaptureError, CaptureMetadata, DriverVersion, EventHandle, Handle,
        MetaFlags, OpenFlags, PacketBatch, PacketHandle, Param, ShutdownDirection, SocketEvent,
        SocketEventKind, intent_filter, packet_filter,
    },
};
use etherparse::PacketBuilder;
use hickory_proto::{
    op::{Message, Query},
    rr::{Name, RecordType},
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::{
    io,
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;

const PROXY: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);
const EGRESS: Egress = Egress {
    interface: 12,
    subinterface: 3,
};
const WAIT: Duration = Duration::from_secs(5);

enum Feed<T> {
    Item(T),
    Fail(CaptureError),
    Shutdown,
}

#[derive(Default)]
struct Lifecycle {
    recv_down: AtomicBool,
    send_down: AtomicBool,
    closed: AtomicBool,
}

impl Lifecycle {
    fn released(&self) -> bool {
        self.recv_down.load(Ordering::SeqCst)
            && self.send_down.load(Ordering::SeqCst)
            && self.closed.load(Ordering::SeqCst)
    }

    fn can_send(&self) -> bool {
        !self.send_down.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }
}

/// Blocking in-memory queue standing in for a driver receive.
struct Queue<T> {
    tx: flume::Sender<Feed<T>>,
    rx: flume::Receiver<Feed<T>>,
    lifecycle: Lifecycle,
}

impl<T> Queue<T> {
    fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            lifecycle: Lifecycle::default(),
        }
    }

    fn push(&self, feed: Feed<T>) {
        self.tx.send(feed).unwrap();
    }

    fn recv(&self, max: usize) -> Result<Vec<T>, CaptureError> {
        if self.lifecycle.recv_down.load(Ordering::SeqCst) {
            return Err(CaptureError::Shutdown);
        }
        let mut items = match self.rx.recv() {
            Ok(Feed::Item(item)) => vec![item],
            Ok(Feed::Fail(err)) => return Err(err),
            Ok(Feed::Shutdown) | Err(_) => return Err(CaptureError::Shutdown),
        };
        while items.len() < max {
            match self.rx.try_recv() {
                Ok(Feed::Item(item)) => items.push(item),
                // leave failures and shutdown for the next receive
                Ok(other) => {
                    self.tx.send(other).unwrap();
                    break;
                }
                Err(_) => break,
            }
        }
        Ok(items)
    }

    fn shutdown(&self, direction: ShutdownDirection) {
        if direction != ShutdownDirection::Recv {
            self.lifecycle.send_down.store(true, Ordering::SeqCst);
        }
        if direction != ShutdownDirection::Send {
            self.lifecycle.recv_down.store(true, Ordering::SeqCst);
            let _ = self.tx.send(Feed::Shutdown);
        }
    }
}

struct MockEvents(Queue<SocketEvent>);

impl Handle for MockEvents {
    fn shutdown(&self, direction: ShutdownDirection) -> Result<(), CaptureError> {
        self.0.shutdown(direction);
        Ok(())
    }

    fn close(&self) -> Result<(), CaptureError> {
        self.0.lifecycle.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl EventHandle for MockEvents {
    fn recv_events(&self, max: usize) -> Result<Vec<SocketEvent>, CaptureError> {
        self.0.recv(max)
    }
}

type Sent = (Vec<u8>, Vec<CaptureMetadata>);

struct MockPackets {
    queue: Queue<PacketBatch>,
    sent: flume::Sender<Sent>,
    params: Mutex<Vec<(Param, u64)>>,
    fail_params: bool,
}

impl MockPackets {
    fn new(fail_params: bool) -> (Self, flume::Receiver<Sent>) {
        let (tx, rx) = flume::unbounded();
        let handle = Self {
            queue: Queue::new(),
            sent: tx,
            params: Mutex::new(Vec::new()),
            fail_params,
        };
        (handle, rx)
    }
}

impl Handle for MockPackets {
    fn shutdown(&self, direction: ShutdownDirection) -> Result<(), CaptureError> {
        self.queue.shutdown(direction);
        Ok(())
    }

    fn close(&self) -> Result<(), CaptureError> {
        self.queue.lifecycle.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl PacketHandle for MockPackets {
    fn recv_packets(&self, _: usize) -> Result<PacketBatch, CaptureError> {
        self.queue.recv(1).map(|mut batches| batches.remove(0))
    }

    fn send_packets(
        &self,
        payload: &[u8],
        metadata: &[CaptureMetadata],
    ) -> Result<usize, CaptureError> {
        if !self.queue.lifecycle.can_send() {
            return Err(CaptureError::Shutdown);
        }
        let _ = self.sent.send((payload.to_vec(), metadata.to_vec()));
        Ok(payload.len())
    }

    fn set_param(&self, param: Param, value: u64) -> Result<(), CaptureError> {
        if self.fail_params {
            return Err(CaptureError::Io(io::Error::other("parameter rejected")));
        }
        self.params.lock().push((param, value));
        Ok(())
    }
}

struct MockDriver {
    intent: Arc<MockEvents>,
    packets: Arc<MockPackets>,
    reinject: Arc<MockPackets>,
    opened: Arc<Mutex<Vec<(String, i16, OpenFlags)>>>,
    fail_reinject: bool,
    version: DriverVersion,
}

impl CaptureDriver for MockDriver {
    fn version(&self) -> Result<DriverVersion, CaptureError> {
        Ok(self.version)
    }

    fn open_network(
        &self,
        filter: &str,
        priority: i16,
        flags: OpenFlags,
    ) -> Result<Arc<dyn PacketHandle>, CaptureError> {
        let mut opened = self.opened.lock();
        let handle: Arc<dyn PacketHandle> = if opened.len() == 1 {
            self.packets.clone()
        } else if self.fail_reinject {
            return Err(CaptureError::Io(io::Error::other("driver not installed")));
        } else {
            self.reinject.clone()
        };
        opened.push((filter.to_owned(), priority, flags));
        Ok(handle)
    }

    fn open_socket(
        &self,
        filter: &str,
        priority: i16,
        flags: OpenFlags,
    ) -> Result<Arc<dyn EventHandle>, CaptureError> {
        self.opened.lock().push((filter.to_owned(), priority, flags));
        let handle: Arc<dyn EventHandle> = self.intent.clone();
        Ok(handle)
    }
}

struct FixedEgress;

impl InterfaceLookup for FixedEgress {
    fn best_interface(&self, destination: Ipv4Addr) -> Result<Egress, Error> {
        assert_eq!(destination, PROXY);
        Ok(EGRESS)
    }
}

struct Names;

impl ProcessNames for Names {
    fn name_for_pid(&mut self, pid: u32) -> String {
        match pid {
            1 => r"C:\Program Files\Chrome\chrome.exe".into(),
            2 => "svchost.exe".into(),
            _ => String::new(),
        }
    }
}

/// Stack that echoes every diverted packet back towards the host.
struct EchoStack {
    inputs: flume::Sender<Vec<u8>>,
    output: StackOutput,
    closed: Arc<AtomicBool>,
}

impl NetStack for EchoStack {
    fn input(&self, packet: &[u8]) -> Result<(), Error> {
        self.output.write(packet)?;
        let _ = self.inputs.send(packet.to_vec());
        Ok(())
    }

    fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Rig {
    intent: Arc<MockEvents>,
    packets: Arc<MockPackets>,
    reinject: Arc<MockPackets>,
    passed: flume::Receiver<Sent>,
    reinjected: flume::Receiver<Sent>,
    stack_inputs: flume::Receiver<Vec<u8>>,
    stack_closed: Arc<AtomicBool>,
    opened: Arc<Mutex<Vec<(String, i16, OpenFlags)>>>,
    services: Option<Services>,
}

impl Rig {
    fn new() -> Self {
        Self::with(false, false)
    }

    fn with(fail_reinject: bool, fail_params: bool) -> Self {
        Self::build(fail_reinject, fail_params, DriverVersion::new(2, 2))
    }

    fn build(fail_reinject: bool, fail_params: bool, version: DriverVersion) -> Self {
        let intent = Arc::new(MockEvents(Queue::new()));
        let (packets, passed) = MockPackets::new(fail_params);
        let (reinject, reinjected) = MockPackets::new(false);
        let (packets, reinject) = (Arc::new(packets), Arc::new(reinject));
        let opened = Arc::new(Mutex::new(Vec::new()));
        let driver = MockDriver {
            intent: Arc::clone(&intent),
            packets: Arc::clone(&packets),
            reinject: Arc::clone(&reinject),
            opened: Arc::clone(&opened),
            fail_reinject,
            version,
        };

        let (inputs, stack_inputs) = flume::unbounded();
        let stack_closed = Arc::new(AtomicBool::new(false));
        let closed = Arc::clone(&stack_closed);
        let stacks = StackFactory::new().register(ProxyKind::Socks5, move |_, output| {
            Ok(Box::new(EchoStack {
                inputs: inputs.clone(),
                output,
                closed: Arc::clone(&closed),
            }) as Box<dyn NetStack>)
        });

        Self {
            intent,
            packets,
            reinject,
            passed,
            reinjected,
            stack_inputs,
            stack_closed,
            opened,
            services: Some(Services {
                driver: Box::new(driver),
                interfaces: Box::new(FixedEgress),
                process_names: Box::new(Names),
                stacks,
            }),
        }
    }

    fn services(&mut self) -> Services {
        self.services.take().unwrap()
    }

    fn all_released(&self) -> bool {
        self.intent.0.lifecycle.released()
            && self.packets.queue.lifecycle.released()
            && self.reinject.queue.lifecycle.released()
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.server.server = PROXY.to_string();
    config.diversion.processes = vec!["chrome.exe".into()];
    config.diversion.whitelist = vec!["example.com".into()];
    config.capture.queue_length = Some(4096);
    config.capture.queue_time = Some(Duration::from_millis(500));
    config
}

fn connect(pid: u32, port: u16) -> SocketEvent {
    SocketEvent {
        kind: SocketEventKind::Connect,
        pid,
        local: format!("10.0.0.2:{port}").parse().unwrap(),
        remote: "93.184.216.34:443".parse().unwrap(),
        protocol: 6,
    }
}

fn tcp(sport: u16) -> Vec<u8> {
    let builder = PacketBuilder::ipv4([10, 0, 0, 2], [93, 184, 216, 34], 64).tcp(sport, 443, 7, 1024);
    let mut packet = Vec::new();
    builder.write(&mut packet, b"hello").unwrap();
    packet
}

fn dns(name: &str) -> Vec<u8> {
    let mut message = Message::new();
    message.add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
    let payload = message.to_vec().unwrap();
    let builder = PacketBuilder::ipv4([10, 0, 0, 2], [8, 8, 8, 8], 64).udp(61000, 53);
    let mut packet = Vec::new();
    builder.write(&mut packet, &payload).unwrap();
    packet
}

async fn next<T>(rx: &flume::Receiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv_async())
        .await
        .expect("timed out")
        .expect("channel closed")
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn diverts_registered_flows_and_whitelisted_dns() {
    let mut rig = Rig::new();
    let engine = DiversionEngine::start(config(), rig.services()).await.unwrap();
    assert_eq!(engine.egress(), EGRESS);
    let registry = engine.registry();
    let cancel = CancellationToken::new();
    let running = tokio::spawn(engine.run_until(cancel.clone()));

    assert_eq!(
        *rig.opened.lock(),
        vec![
            (intent_filter(PROXY), 100, OpenFlags::SNIFF | OpenFlags::RECV_ONLY),
            (packet_filter(12, PROXY), 101, OpenFlags::empty()),
            ("false".to_owned(), 102, OpenFlags::SEND_ONLY),
        ]
    );
    assert_eq!(
        *rig.packets.params.lock(),
        vec![(Param::QueueLength, 4096), (Param::QueueTime, 500)]
    );

    for event in [connect(2, 50001), connect(1, 50000), connect(1, 50000)] {
        rig.intent.0.push(Feed::Item(event));
    }
    wait_until(|| registry.len() == 1).await;

    let diverted = tcp(50000);
    let passed = tcp(50001);
    let dns_hit = dns("www.Example.com.");
    let dns_miss = dns("other.org.");
    let meta = CaptureMetadata {
        timestamp: 99,
        interface: 12,
        subinterface: 3,
        flags: MetaFlags::OUTBOUND | MetaFlags::IP_CHECKSUM,
    };
    let mut batch = PacketBatch::with_capacity(4, 512);
    for packet in [&diverted, &passed, &dns_hit, &dns_miss] {
        batch.push(packet, meta);
    }
    rig.packets.queue.push(Feed::Item(batch));

    // passthrough: one batched send, byte-for-byte, original metadata
    let (payload, metadata) = next(&rig.passed).await;
    assert_eq!(payload, [passed.as_slice(), &dns_miss].concat());
    assert_eq!(metadata, vec![meta, meta]);

    assert_eq!(next(&rig.stack_inputs).await, diverted);
    assert_eq!(next(&rig.stack_inputs).await, dns_hit);

    // stack output comes back as inbound impostors on the egress interface
    let mut reinjected = Vec::new();
    let mut reinjected_meta = Vec::new();
    while reinjected_meta.len() < 2 {
        let (payload, metadata) = next(&rig.reinjected).await;
        reinjected.extend(payload);
        reinjected_meta.extend(metadata);
    }
    assert_eq!(reinjected, [diverted.as_slice(), &dns_hit].concat());
    assert!(
        reinjected_meta
            .iter()
            .all(|m| *m == CaptureMetadata::reinjection(12, 3))
    );

    cancel.cancel();
    tokio::time::timeout(WAIT, running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(rig.all_released());
    assert!(rig.stack_closed.load(Ordering::SeqCst));
    assert_eq!(registry.len(), 1);
    assert!(rig.passed.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_open_releases_opened_handles() {
    let mut rig = Rig::with(true, false);
    let err = DiversionEngine::start(config(), rig.services())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Capture(CaptureError::Io(_))));
    assert!(rig.intent.0.lifecycle.released());
    assert!(rig.packets.queue.lifecycle.released());
    assert_eq!(rig.opened.lock().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_tuning_releases_every_handle() {
    let mut rig = Rig::with(false, true);
    let err = DiversionEngine::start(config(), rig.services())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Capture(CaptureError::Io(_))));
    assert!(rig.all_released());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_config_opens_nothing() {
    let mut rig = Rig::new();
    let mut config = config();
    config.capture.queue_length = Some(20000);
    let err = DiversionEngine::start(config, rig.services())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Config(_)));

    let mut rig = Rig::new();
    let mut config = self::config();
    config.server.kind = ProxyKind::Shadowsocks;
    let err = DiversionEngine::start(config, rig.services())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::UnsupportedProxy(ProxyKind::Shadowsocks)));

    let mut rig = Rig::new();
    let mut config = self::config();
    config.diversion.whitelist = vec!["||example.com^$third-party".into()];
    let err = DiversionEngine::start(config, rig.services())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::InvalidRule { .. }));
    assert!(rig.opened.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fatal_loop_error_tears_everything_down() {
    let mut rig = Rig::new();
    let mut config = config();
    config.pipeline.intent_errors = IntentErrorPolicy::Exit;
    let engine = DiversionEngine::start(config, rig.services()).await.unwrap();
    let running = tokio::spawn(engine.run_until(CancellationToken::new()));

    rig.intent
        .0
        .push(Feed::Fail(CaptureError::Io(io::Error::other("driver gone"))));
    let result = tokio::time::timeout(WAIT, running).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Capture(CaptureError::Io(_)))));
    assert!(rig.all_released());
    assert!(rig.stack_closed.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_driver_version_opens_nothing() {
    let mut rig = Rig::build(false, false, DriverVersion::new(1, 4));
    let err = DiversionEngine::start(config(), rig.services())
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        Error::Capture(CaptureError::UnsupportedVersion(version)) if version == DriverVersion::new(1, 4)
    ));
    assert!(rig.opened.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_flushes_pending_stack_output() {
    let mut rig = Rig::new();
    let mut config = config();
    // only the final flush can reinject the packet
    config.pipeline.flush_interval = Duration::from_secs(30);
    let engine = DiversionEngine::start(config, rig.services()).await.unwrap();
    let registry = engine.registry();
    let cancel = CancellationToken::new();
    let running = tokio::spawn(engine.run_until(cancel.clone()));

    rig.intent.0.push(Feed::Item(connect(1, 50000)));
    wait_until(|| registry.len() == 1).await;

    let diverted = tcp(50000);
    let meta = CaptureMetadata {
        interface: 12,
        subinterface: 3,
        flags: MetaFlags::OUTBOUND,
        ..Default::default()
    };
    let mut batch = PacketBatch::with_capacity(1, diverted.len());
    batch.push(&diverted, meta);
    rig.packets.queue.push(Feed::Item(batch));
    assert_eq!(next(&rig.stack_inputs).await, diverted);
    assert!(rig.reinjected.try_recv().is_err());

    cancel.cancel();
    tokio::time::timeout(WAIT, running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let (payload, metadata) = rig.reinjected.try_recv().unwrap();
    assert_eq!(payload, diverted);
    assert_eq!(metadata, vec![CaptureMetadata::reinjection(12, 3)]);
    assert!(rig.all_released());
}
