// Shroud end-to-end datapath tests.
// Runs whole nodes (store client, router, workers, aggregator) against the
// in-memory store, mock tunnel devices, and the mock datagram fabric. No
// root, no kernel interfaces.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use shroud::config::{Cli, Config};
use shroud::device::MockDevice;
use shroud::mapping::Mapping;
use shroud::metric::{Aggregator, StatsSnapshot, TrafficDirection};
use shroud::payload::{HEADER_SIZE, MTU, NONCE_LENGTH, TAG_LENGTH};
use shroud::plugin;
use shroud::router::RouteTable;
use shroud::socket::{MockNetwork, MockSocket};
use shroud::store::{MemoryStore, StoreClient};
use shroud::worker::{Incoming, Outgoing};

const WAIT: Duration = Duration::from_secs(5);

/// One fully wired node over the mock transports.
struct TestNode {
    cfg: Config,
    private_ip: Ipv4Addr,
    dev: Arc<MockDevice>,
    sock: Arc<MockSocket>,
    router: Arc<RouteTable>,
    aggregator: Arc<Aggregator>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

struct NodeOptions {
    name: &'static str,
    public_ip: &'static str,
    requested_ip: Option<&'static str>,
    plugins: Vec<String>,
    gateway: bool,
}

impl NodeOptions {
    fn new(name: &'static str, public_ip: &'static str) -> Self {
        Self {
            name,
            public_ip,
            requested_ip: None,
            plugins: Vec::new(),
            gateway: false,
        }
    }
}

fn spawn_node(
    store: &Arc<MemoryStore>,
    network: &Arc<MockNetwork>,
    options: NodeOptions,
) -> TestNode {
    let data_dir = std::env::temp_dir().join(format!(
        "shroud-e2e-{}-{}",
        options.name,
        std::process::id()
    ));
    std::fs::create_dir_all(&data_dir).unwrap();

    let mut cfg = Config::load(Cli {
        data_dir: Some(data_dir),
        datastore: Some("memory".into()),
        public_ip: Some(options.public_ip.parse().unwrap()),
        private_ip: options.requested_ip.map(|ip| ip.parse().unwrap()),
        plugins: Some(options.plugins.join(",")),
        gateway: options.gateway,
        workers: Some(1),
        ..Cli::default()
    })
    .unwrap();
    cfg.sync_interval = Duration::from_millis(50);
    cfg.refresh_interval = Duration::from_secs(60);
    cfg.stats_window = Duration::from_millis(100);

    let client = Arc::new(StoreClient::new(store.clone(), &cfg));
    let netcfg = client.init(&mut cfg).unwrap();
    let private_ip = cfg.private_ip.unwrap();

    let router = Arc::new(RouteTable::new(netcfg.network));
    let dev = Arc::new(MockDevice::new(cfg.num_workers));
    let sock = network.socket(
        std::net::SocketAddr::new(cfg.public_ipv4.unwrap().into(), cfg.listen_port),
        cfg.num_workers,
    );
    let plugins = Arc::new(plugin::build(&cfg.plugins).unwrap());
    let aggregator = Arc::new(Aggregator::new(cfg.num_workers, cfg.stats_window));
    let stop = Arc::new(AtomicBool::new(false));

    let mut handles = vec![
        client.clone().start(router.clone(), stop.clone()),
        aggregator.clone().start(stop.clone()),
    ];

    let outgoing = Outgoing::new(
        private_ip,
        router.clone(),
        plugins.clone(),
        dev.clone(),
        sock.clone(),
    );
    let incoming = Incoming::new(router.clone(), plugins, dev.clone(), sock.clone());
    for queue in 0..cfg.num_workers {
        handles.push(outgoing.start(
            queue,
            aggregator.recorder(TrafficDirection::Tx, queue),
            stop.clone(),
        ));
        handles.push(incoming.start(
            queue,
            aggregator.recorder(TrafficDirection::Rx, queue),
            stop.clone(),
        ));
    }

    TestNode {
        cfg,
        private_ip,
        dev,
        sock,
        router,
        aggregator,
        stop,
        handles,
    }
}

impl TestNode {
    /// Wait until the routing table holds at least `n` mappings.
    fn wait_for_peers(&self, n: usize) {
        let deadline = Instant::now() + WAIT;
        while self.router.len() < n {
            assert!(
                Instant::now() < deadline,
                "router never reached {} mappings",
                n
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Wait for a packet to land on the tunnel.
    fn wait_for_delivery(&self) -> Vec<u8> {
        let deadline = Instant::now() + WAIT;
        loop {
            let mut delivered = self.dev.take_delivered(0);
            if let Some(packet) = delivered.pop() {
                return packet;
            }
            assert!(Instant::now() < deadline, "no packet delivered to tunnel");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Wait until the aggregated snapshot satisfies `pred`.
    fn wait_for_stats(&self, pred: impl Fn(&StatsSnapshot) -> bool) -> StatsSnapshot {
        let deadline = Instant::now() + WAIT;
        loop {
            let snapshot = self.aggregator.stats().read().unwrap().clone();
            if pred(&snapshot) {
                return snapshot;
            }
            assert!(
                Instant::now() < deadline,
                "stats never converged: {:?}",
                snapshot
            );
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// The derived mapping `other` holds for this node, session AEAD included.
    fn mapping_seen_by(&self, other: &TestNode) -> Arc<Mapping> {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(mapping) = other.router.resolve(self.private_ip.octets()) {
                return mapping;
            }
            assert!(Instant::now() < deadline, "mapping never appeared");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            handle.join().unwrap();
        }
        std::fs::remove_dir_all(&self.cfg.data_dir).ok();
    }
}

/// A minimal IPv4 packet of `total` bytes with the given endpoints.
fn ip_packet(src: Ipv4Addr, dst: Ipv4Addr, total: usize) -> Vec<u8> {
    assert!(total >= 20);
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    for (i, b) in packet[20..].iter_mut().enumerate() {
        *b = i as u8;
    }
    packet
}

#[test]
fn test_two_node_echo_is_byte_identical() {
    let store = Arc::new(MemoryStore::new());
    let network = MockNetwork::new();
    let a = spawn_node(&store, &network, {
        let mut o = NodeOptions::new("echo-a", "203.0.113.1");
        o.requested_ip = Some("10.10.0.2");
        o
    });
    let b = spawn_node(&store, &network, {
        let mut o = NodeOptions::new("echo-b", "203.0.113.2");
        o.requested_ip = Some("10.10.0.3");
        o
    });
    a.wait_for_peers(2);
    b.wait_for_peers(2);

    let request = ip_packet(a.private_ip, b.private_ip, 64);
    a.dev.inject(0, request.clone());

    assert_eq!(b.wait_for_delivery(), request);
    let stats = a.wait_for_stats(|s| s.tx.packets == 1);
    assert_eq!(stats.tx.dropped_packets, 0);
    assert_eq!(
        stats.tx.bytes as usize,
        HEADER_SIZE + request.len() + TAG_LENGTH
    );

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_mtu_sized_body_survives_intact() {
    let store = Arc::new(MemoryStore::new());
    let network = MockNetwork::new();
    let a = spawn_node(&store, &network, NodeOptions::new("mtu-a", "203.0.113.11"));
    let b = spawn_node(&store, &network, NodeOptions::new("mtu-b", "203.0.113.12"));
    a.wait_for_peers(2);

    let packet = ip_packet(a.private_ip, b.private_ip, MTU);
    a.dev.inject(0, packet.clone());
    assert_eq!(b.wait_for_delivery(), packet);

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_flipped_tag_never_reaches_the_tunnel() {
    let store = Arc::new(MemoryStore::new());
    let network = MockNetwork::new();
    let a = spawn_node(&store, &network, NodeOptions::new("auth-a", "203.0.113.21"));
    let b = spawn_node(&store, &network, NodeOptions::new("auth-b", "203.0.113.22"));
    a.wait_for_peers(2);
    b.wait_for_peers(2);

    // Seal a legitimate datagram from A, then corrupt the last tag byte.
    let b_mapping = b.mapping_seen_by(&a);
    let body = ip_packet(a.private_ip, b.private_ip, 64);
    let mut nonce = [0u8; NONCE_LENGTH];
    nonce.copy_from_slice(&[7u8; NONCE_LENGTH]);
    let mut sealed = body.clone();
    let tag = b_mapping.aead.seal_in_place(&nonce, &mut sealed).unwrap();

    let mut wire = Vec::new();
    wire.extend_from_slice(&a.private_ip.octets());
    wire.extend_from_slice(&nonce);
    wire.extend_from_slice(&sealed);
    wire.extend_from_slice(&tag);
    *wire.last_mut().unwrap() ^= 0x01;

    network.inject(b.sock.addr(), 0, wire, a.sock.addr());

    let stats = b.wait_for_stats(|s| s.rx.dropped_auth == 1);
    assert_eq!(stats.rx.packets, 0);
    assert!(b.dev.take_delivered(0).is_empty());

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_asymmetric_compression_is_bypassed_both_ways() {
    let store = Arc::new(MemoryStore::new());
    let network = MockNetwork::new();
    // A offers compression; B does not advertise it.
    let a = spawn_node(&store, &network, {
        let mut o = NodeOptions::new("comp-a", "203.0.113.31");
        o.plugins = vec!["compression".into()];
        o
    });
    let b = spawn_node(&store, &network, NodeOptions::new("comp-b", "203.0.113.32"));
    a.wait_for_peers(2);
    b.wait_for_peers(2);

    // Highly compressible, would shrink dramatically if the plugin ran.
    let mut packet = ip_packet(a.private_ip, b.private_ip, 1500);
    for byte in packet[20..].iter_mut() {
        *byte = 0x61;
    }
    a.dev.inject(0, packet.clone());
    assert_eq!(b.wait_for_delivery(), packet);

    // The wire carried the full uncompressed length.
    let stats = a.wait_for_stats(|s| s.tx.packets == 1);
    assert_eq!(
        stats.tx.bytes as usize,
        HEADER_SIZE + packet.len() + TAG_LENGTH
    );

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_symmetric_compression_round_trips() {
    let store = Arc::new(MemoryStore::new());
    let network = MockNetwork::new();
    let mut options_a = NodeOptions::new("comp2-a", "203.0.113.41");
    options_a.plugins = vec!["compression".into()];
    let mut options_b = NodeOptions::new("comp2-b", "203.0.113.42");
    options_b.plugins = vec!["compression".into()];
    let a = spawn_node(&store, &network, options_a);
    let b = spawn_node(&store, &network, options_b);
    a.wait_for_peers(2);
    b.wait_for_peers(2);

    let mut packet = ip_packet(a.private_ip, b.private_ip, 1500);
    for byte in packet[20..].iter_mut() {
        *byte = 0x61;
    }
    a.dev.inject(0, packet.clone());
    assert_eq!(b.wait_for_delivery(), packet);

    // The wire carried the compressed length.
    let stats = a.wait_for_stats(|s| s.tx.packets == 1);
    assert!(
        (stats.tx.bytes as usize) < HEADER_SIZE + packet.len() + TAG_LENGTH,
        "wire bytes {} not compressed",
        stats.tx.bytes
    );

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_gateway_receives_off_subnet_traffic() {
    let store = Arc::new(MemoryStore::new());
    let network = MockNetwork::new();
    let a = spawn_node(&store, &network, NodeOptions::new("gw-a", "203.0.113.51"));
    let g = spawn_node(&store, &network, {
        let mut o = NodeOptions::new("gw-g", "203.0.113.52");
        o.gateway = true;
        o
    });
    a.wait_for_peers(2);
    g.wait_for_peers(2);

    let packet = ip_packet(a.private_ip, "8.8.8.8".parse().unwrap(), 80);
    a.dev.inject(0, packet.clone());

    assert_eq!(g.wait_for_delivery(), packet);
    let stats = a.wait_for_stats(|s| s.tx.packets == 1);
    assert_eq!(stats.tx.dropped_packets, 0);

    a.shutdown();
    g.shutdown();
}

#[test]
fn test_off_subnet_without_gateway_drops_no_route() {
    let store = Arc::new(MemoryStore::new());
    let network = MockNetwork::new();
    let a = spawn_node(&store, &network, NodeOptions::new("nogw-a", "203.0.113.61"));
    a.wait_for_peers(1);

    let packet = ip_packet(a.private_ip, "8.8.8.8".parse().unwrap(), 80);
    a.dev.inject(0, packet);

    let stats = a.wait_for_stats(|s| s.tx.dropped_no_route == 1);
    assert_eq!(stats.tx.packets, 0);

    a.shutdown();
}

#[test]
fn test_lease_loss_terminates_the_supervisor() {
    use shroud::supervisor::Supervisor;

    let store = Arc::new(MemoryStore::new());
    let data_dir = std::env::temp_dir().join(format!("shroud-e2e-lost-{}", std::process::id()));
    std::fs::create_dir_all(&data_dir).unwrap();

    let mut cfg = Config::load(Cli {
        data_dir: Some(data_dir.clone()),
        datastore: Some("memory".into()),
        public_ip: Some("203.0.113.81".parse().unwrap()),
        workers: Some(1),
        ..Cli::default()
    })
    .unwrap();
    cfg.refresh_interval = Duration::from_millis(30);
    cfg.sync_interval = Duration::from_secs(60);

    let client = Arc::new(StoreClient::new(store.clone(), &cfg));
    let netcfg = client.init(&mut cfg).unwrap();
    let router = Arc::new(RouteTable::new(netcfg.network));

    let dev: Arc<MockDevice> = Arc::new(MockDevice::new(1));
    let network = MockNetwork::new();
    let sock = network.socket("203.0.113.81:1099".parse().unwrap(), 1);
    let plugins = Arc::new(plugin::build(&[]).unwrap());
    let stop = Arc::new(AtomicBool::new(false));

    let mut supervisor = Supervisor::new(
        Arc::new(cfg),
        dev,
        sock,
        client.clone(),
        plugins,
        stop.clone(),
    );
    supervisor.register("store-client", client.clone().start(router, stop));

    store.set_fail_writes(true);
    let started = Instant::now();
    let result = supervisor.run();
    assert!(result.is_err(), "supervisor must exit with an error");
    assert!(started.elapsed() < Duration::from_secs(10));

    std::fs::remove_dir_all(&data_dir).ok();
}

#[test]
fn test_runt_datagram_is_dropped_before_the_aead() {
    let store = Arc::new(MemoryStore::new());
    let network = MockNetwork::new();
    let b = spawn_node(&store, &network, NodeOptions::new("runt-b", "203.0.113.71"));
    b.wait_for_peers(1);

    network.inject(
        b.sock.addr(),
        0,
        vec![0u8; HEADER_SIZE + TAG_LENGTH - 1],
        "203.0.113.99:1099".parse().unwrap(),
    );

    let stats = b.wait_for_stats(|s| s.rx.dropped_packets == 1);
    assert_eq!(stats.rx.dropped_malformed, 1);
    assert!(b.dev.take_delivered(0).is_empty());

    b.shutdown();
}
