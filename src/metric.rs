//! Lock-free datapath counters and the windowed aggregator.
//!
//! Workers push fixed-size [`Metric`] records into a bounded per-queue ring;
//! the aggregator thread drains them into running totals and recomputes
//! bandwidth over a configured window. When a ring fills up the producer
//! overwrites the oldest record: metrics are advisory and must never block
//! or slow the datapath.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use tracing::debug;

/// Per-queue ring capacity. Sized for several windows of worst-case packet
/// rates on one queue.
const RING_CAPACITY: usize = 1024;

/// Traffic direction of a metric record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficDirection {
    Tx,
    Rx,
}

/// Why a packet was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropReason {
    NoRoute,
    Auth,
    Malformed,
    Transform,
    Io,
}

/// One datapath event, recorded per packet.
#[derive(Debug, Clone, Copy)]
pub struct Metric {
    pub queue: usize,
    pub dropped: bool,
    pub reason: Option<DropReason>,
    pub bytes: u64,
    pub peer: Option<Ipv4Addr>,
}

/// A worker's handle onto its own ring.
#[derive(Clone)]
pub struct Recorder {
    ring: Arc<ArrayQueue<Metric>>,
    queue: usize,
}

impl Recorder {
    /// Record a successfully forwarded packet
    pub fn forwarded(&self, bytes: u64, peer: Option<Ipv4Addr>) {
        self.push(Metric {
            queue: self.queue,
            dropped: false,
            reason: None,
            bytes,
            peer,
        });
    }

    /// Record a dropped packet
    pub fn dropped(&self, reason: DropReason, bytes: u64, peer: Option<Ipv4Addr>) {
        self.push(Metric {
            queue: self.queue,
            dropped: true,
            reason: Some(reason),
            bytes,
            peer,
        });
    }

    fn push(&self, metric: Metric) {
        // A full ring displaces the oldest record rather than blocking.
        self.ring.force_push(metric);
    }
}

/// Counters for one direction of one queue
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub packets: u64,
    pub bytes: u64,
    pub dropped_packets: u64,
}

/// Per-peer byte accounting
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerStats {
    pub packets: u64,
    pub bytes: u64,
    pub dropped_packets: u64,
}

/// Aggregated counters for one traffic direction
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectionStats {
    pub packets: u64,
    pub bytes: u64,
    pub dropped_packets: u64,
    pub dropped_no_route: u64,
    pub dropped_auth: u64,
    pub dropped_malformed: u64,
    pub dropped_transform: u64,
    pub dropped_io: u64,
    pub packets_per_second: f64,
    pub bytes_per_second: f64,
    pub queues: Vec<QueueStats>,
    pub peers: HashMap<String, PeerStats>,
}

impl DirectionStats {
    fn new(num_queues: usize) -> Self {
        Self {
            queues: vec![QueueStats::default(); num_queues],
            ..Self::default()
        }
    }

    fn apply(&mut self, metric: &Metric) {
        let queue = &mut self.queues[metric.queue];
        if metric.dropped {
            self.dropped_packets += 1;
            queue.dropped_packets += 1;
            match metric.reason {
                Some(DropReason::NoRoute) => self.dropped_no_route += 1,
                Some(DropReason::Auth) => self.dropped_auth += 1,
                Some(DropReason::Malformed) => self.dropped_malformed += 1,
                Some(DropReason::Transform) => self.dropped_transform += 1,
                Some(DropReason::Io) => self.dropped_io += 1,
                None => {}
            }
        } else {
            self.packets += 1;
            self.bytes += metric.bytes;
            queue.packets += 1;
            queue.bytes += metric.bytes;
        }
        if let Some(peer) = metric.peer {
            let peer = self.peers.entry(peer.to_string()).or_default();
            if metric.dropped {
                peer.dropped_packets += 1;
            } else {
                peer.packets += 1;
                peer.bytes += metric.bytes;
            }
        }
    }

    fn rates(&mut self, prev_packets: u64, prev_bytes: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        self.packets_per_second = (self.packets - prev_packets) as f64 / secs;
        self.bytes_per_second = (self.bytes - prev_bytes) as f64 / secs;
    }
}

/// The full statistics view exposed over HTTP
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub tx: DirectionStats,
    pub rx: DirectionStats,
}

/// Shared read handle onto the latest snapshot
pub type StatsHandle = Arc<RwLock<StatsSnapshot>>;

/// Drains worker rings into a windowed statistics view.
pub struct Aggregator {
    tx_rings: Vec<Arc<ArrayQueue<Metric>>>,
    rx_rings: Vec<Arc<ArrayQueue<Metric>>>,
    window: Duration,
    stats: StatsHandle,
}

impl Aggregator {
    pub fn new(num_workers: usize, window: Duration) -> Self {
        let ring = |_| Arc::new(ArrayQueue::new(RING_CAPACITY));
        Self {
            tx_rings: (0..num_workers).map(ring).collect(),
            rx_rings: (0..num_workers).map(ring).collect(),
            window,
            stats: Arc::new(RwLock::new(StatsSnapshot {
                tx: DirectionStats::new(num_workers),
                rx: DirectionStats::new(num_workers),
            })),
        }
    }

    /// The recorder for one worker queue. Each (direction, queue) pair has
    /// exactly one producer.
    pub fn recorder(&self, direction: TrafficDirection, queue: usize) -> Recorder {
        let ring = match direction {
            TrafficDirection::Tx => self.tx_rings[queue].clone(),
            TrafficDirection::Rx => self.rx_rings[queue].clone(),
        };
        Recorder { ring, queue }
    }

    /// Read handle for the HTTP endpoint
    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    /// Start the aggregation thread.
    pub fn start(self: Arc<Self>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("shroud-agg".into())
            .spawn(move || self.run(stop))
            .expect("failed to spawn aggregator thread")
    }

    fn run(&self, stop: Arc<AtomicBool>) {
        let mut window_start = Instant::now();
        let mut prev = (0u64, 0u64, 0u64, 0u64);

        while !stop.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(250));
            self.drain();

            if window_start.elapsed() >= self.window {
                let mut stats = self.stats.write().unwrap();
                let elapsed = window_start.elapsed();
                stats.tx.rates(prev.0, prev.1, elapsed);
                stats.rx.rates(prev.2, prev.3, elapsed);
                prev = (
                    stats.tx.packets,
                    stats.tx.bytes,
                    stats.rx.packets,
                    stats.rx.bytes,
                );
                window_start = Instant::now();
            }
        }
        // Final drain so shutdown does not lose tail records.
        self.drain();
        debug!("Aggregator stopped");
    }

    fn drain(&self) {
        let mut stats = self.stats.write().unwrap();
        for ring in &self.tx_rings {
            while let Some(metric) = ring.pop() {
                stats.tx.apply(&metric);
            }
        }
        for ring in &self.rx_rings {
            while let Some(metric) = ring.pop() {
                stats.rx.apply(&metric);
            }
        }
    }
}
