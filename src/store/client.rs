//! Lease acquisition and peer-set reconciliation.
//!
//! The store client owns every interaction with the control plane: it
//! installs the network definition on first boot, leases a private address
//! under the network lock, publishes the local mapping, refreshes the lease
//! ahead of expiry, and keeps the routing table synchronized with the
//! stored peer set through full reconciles and watch deltas.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use crate::config::{Config, NetworkConfig};
use crate::crypto::KeyPair;
use crate::error::{Error, Result};
use crate::mapping::{Mapping, MappingRecord};
use crate::router::RouteTable;
use crate::store::{Store, WatchEvent, WatchOp, LOCK_TTL};

/// Consecutive refresh failures before the lease is considered lost.
const MAX_REFRESH_FAILURES: u32 = 3;

/// How long to keep retrying the network lock before giving up.
const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of this node's lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Unregistered,
    Registered,
    Releasing,
    Lost,
}

/// The control-plane client.
pub struct StoreClient {
    store: Arc<dyn Store>,
    prefix: String,
    machine_id: String,
    keypair: Arc<KeyPair>,
    refresh_interval: Duration,
    sync_interval: Duration,
    lease_time: Mutex<Duration>,
    record: Mutex<Option<MappingRecord>>,
    state: Mutex<LeaseState>,
    lost: AtomicBool,
}

impl StoreClient {
    pub fn new(store: Arc<dyn Store>, cfg: &Config) -> Self {
        Self {
            store,
            prefix: cfg.prefix.clone(),
            machine_id: cfg.machine_id.clone(),
            keypair: cfg.keypair.clone(),
            refresh_interval: cfg.refresh_interval,
            sync_interval: cfg.sync_interval,
            lease_time: Mutex::new(NetworkConfig::default().lease_time),
            record: Mutex::new(None),
            state: Mutex::new(LeaseState::Unregistered),
            lost: AtomicBool::new(false),
        }
    }

    fn network_key(&self) -> String {
        format!("{}/config/network", self.prefix)
    }

    fn lock_key(&self) -> String {
        format!("{}/locks/network", self.prefix)
    }

    fn nodes_prefix(&self) -> String {
        format!("{}/nodes/", self.prefix)
    }

    fn node_key(&self, machine_id: &str) -> String {
        format!("{}/nodes/{}", self.prefix, machine_id)
    }

    /// Current lease state
    pub fn lease_state(&self) -> LeaseState {
        *self.state.lock().unwrap()
    }

    /// Whether the lease has been lost; the supervisor exits when set
    pub fn lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Full startup sequence: read or install the network definition, lease
    /// a private address, publish the local mapping. Fills the leased
    /// address and overlay subnet into the config. Network-level writes all
    /// happen under the shared network lock.
    pub fn init(&self, cfg: &mut Config) -> Result<NetworkConfig> {
        let lock = self.acquire_network_lock()?;
        let result = self.init_locked(cfg);
        self.store.release_lock(lock)?;
        let (netcfg, private_ip) = result?;

        cfg.private_ip = Some(private_ip);
        cfg.subnet = netcfg.network;
        std::fs::write(cfg.private_ip_path(), private_ip.to_string())?;

        *self.state.lock().unwrap() = LeaseState::Registered;
        info!(
            "Registered {} in {} (lease {:?})",
            private_ip, netcfg.network, netcfg.lease_time
        );
        Ok(netcfg)
    }

    fn init_locked(&self, cfg: &Config) -> Result<(NetworkConfig, Ipv4Addr)> {
        let netcfg = self.ensure_network_config()?;
        *self.lease_time.lock().unwrap() = netcfg.lease_time;
        let private_ip = self.acquire_address_locked(cfg, &netcfg)?;
        Ok((netcfg, private_ip))
    }

    /// Read the stored network definition, installing the default with
    /// create-if-absent semantics when the store is empty.
    fn ensure_network_config(&self) -> Result<NetworkConfig> {
        let key = self.network_key();
        if let Some(data) = self.store.get(&key)? {
            return NetworkConfig::from_bytes(&data);
        }

        let default = NetworkConfig::default();
        if self.store.create_if_absent(&key, &default.to_bytes()?, None)? {
            info!("Installed default network config {}", default.network);
            return Ok(default);
        }
        // Another node won the race; read what it wrote.
        let data = self
            .store
            .get(&key)?
            .ok_or_else(|| Error::Store("network config vanished during startup".into()))?;
        NetworkConfig::from_bytes(&data)
    }

    fn acquire_network_lock(&self) -> Result<crate::store::LockHandle> {
        let deadline = Instant::now() + LOCK_ACQUIRE_TIMEOUT;
        loop {
            match self.store.acquire_lock(&self.lock_key(), LOCK_TTL) {
                Ok(handle) => return Ok(handle),
                Err(Error::LockHeld(_)) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(250));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Lease a private address. Caller holds the network lock.
    ///
    /// An existing lease owned by this machine id is adopted as-is.
    /// Otherwise candidates are tried in deterministic order (the requested
    /// address, the address persisted from a previous run, then the lowest
    /// free host), each through the store's create-if-absent primitive.
    fn acquire_address_locked(&self, cfg: &Config, netcfg: &NetworkConfig) -> Result<Ipv4Addr> {
        let mut leased = HashMap::new();
        for (_, data) in self.store.list(&self.nodes_prefix())? {
            match MappingRecord::from_bytes(&data) {
                Ok(record) => {
                    leased.insert(record.private_ip, record.machine_id.clone());
                }
                Err(e) => warn!("Skipping unparseable node record: {}", e),
            }
        }

        // A crash or reload left our own lease behind: adopt and refresh it.
        if let Some((ip, _)) = leased.iter().find(|(_, id)| **id == self.machine_id) {
            let ip = *ip;
            info!("Adopting existing lease for {}", ip);
            self.publish_record(cfg, ip, netcfg)?;
            return Ok(ip);
        }

        let persisted: Option<Ipv4Addr> = std::fs::read_to_string(cfg.private_ip_path())
            .ok()
            .and_then(|s| s.trim().parse().ok());

        let preferred = cfg
            .requested_ip
            .into_iter()
            .chain(persisted)
            .filter(|ip| netcfg.network.contains(ip));
        let candidates = preferred.chain(netcfg.network.hosts());

        for candidate in candidates {
            if leased.contains_key(&candidate) {
                continue;
            }
            let record = self.build_record(cfg, candidate, netcfg);
            let lease_time = netcfg.lease_time;
            if self.store.create_if_absent(
                &self.node_key(&self.machine_id),
                &record.to_bytes()?,
                Some(lease_time),
            )? {
                *self.record.lock().unwrap() = Some(record);
                return Ok(candidate);
            }
            // Lost a create race despite the lock; retry with the next free
            // candidate.
            debug!("Lease creation collided at {}, retrying", candidate);
        }

        Err(Error::SubnetExhausted(netcfg.network.to_string()))
    }

    fn build_record(&self, cfg: &Config, ip: Ipv4Addr, netcfg: &NetworkConfig) -> MappingRecord {
        MappingRecord {
            private_ip: ip,
            public_key: self.keypair.public_key_base64(),
            ipv4: cfg.public_ipv4,
            ipv6: cfg.public_ipv6,
            port: cfg.listen_port,
            machine_id: self.machine_id.clone(),
            gateway: cfg.gateway,
            plugins: cfg.plugins.clone(),
            expires_at: now_unix() + netcfg.lease_time.as_secs(),
        }
    }

    fn publish_record(&self, cfg: &Config, ip: Ipv4Addr, netcfg: &NetworkConfig) -> Result<()> {
        let record = self.build_record(cfg, ip, netcfg);
        self.store.put(
            &self.node_key(&self.machine_id),
            &record.to_bytes()?,
            Some(netcfg.lease_time),
        )?;
        *self.record.lock().unwrap() = Some(record);
        Ok(())
    }

    /// Re-publish the local record with a fresh expiration.
    fn refresh(&self) -> Result<()> {
        let lease_time = *self.lease_time.lock().unwrap();
        let mut guard = self.record.lock().unwrap();
        let record = guard
            .as_mut()
            .ok_or_else(|| Error::Store("refresh before registration".into()))?;
        record.expires_at = now_unix() + lease_time.as_secs();
        self.store.put(
            &self.node_key(&self.machine_id),
            &record.to_bytes()?,
            Some(lease_time),
        )?;
        Ok(())
    }

    /// Release the lease on graceful shutdown.
    pub fn release(&self) -> Result<()> {
        *self.state.lock().unwrap() = LeaseState::Releasing;
        self.store.delete(&self.node_key(&self.machine_id))?;
        *self.state.lock().unwrap() = LeaseState::Unregistered;
        info!("Released lease");
        Ok(())
    }

    /// Start the background reconcile loop.
    pub fn start(self: Arc<Self>, router: Arc<RouteTable>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("shroud-store".into())
            .spawn(move || self.run(router, stop))
            .expect("failed to spawn store client thread")
    }

    fn run(&self, router: Arc<RouteTable>, stop: Arc<AtomicBool>) {
        let watch = match self.store.watch(&self.nodes_prefix()) {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!("Backend does not deliver watch events: {}", e);
                None
            }
        };

        let mut cache: HashMap<String, MappingRecord> = HashMap::new();
        let mut last_refresh = Instant::now();
        let mut refresh_failures = 0u32;
        // Reconcile immediately so the datapath starts with a full table.
        let mut last_sync: Option<Instant> = None;

        while !stop.load(Ordering::Relaxed) {
            let dirty = match &watch {
                Some(rx) => self.drain_watch(rx, &mut cache),
                None => {
                    std::thread::sleep(Duration::from_millis(50));
                    false
                }
            };

            if last_sync.is_none_or(|t| t.elapsed() >= self.sync_interval) {
                match self.full_sync(&mut cache) {
                    Ok(()) => self.rebuild(&cache, &router),
                    // Keep the last good snapshot on control-plane errors.
                    Err(e) => warn!("Full sync failed, keeping last snapshot: {}", e),
                }
                last_sync = Some(Instant::now());
            } else if dirty {
                self.rebuild(&cache, &router);
            }

            if last_refresh.elapsed() >= self.refresh_interval {
                match self.refresh() {
                    Ok(()) => refresh_failures = 0,
                    Err(e) => {
                        refresh_failures += 1;
                        warn!(
                            "Lease refresh failed ({}/{}): {}",
                            refresh_failures, MAX_REFRESH_FAILURES, e
                        );
                        if refresh_failures >= MAX_REFRESH_FAILURES {
                            error!("Lease lost; this node must re-register");
                            *self.state.lock().unwrap() = LeaseState::Lost;
                            self.lost.store(true, Ordering::SeqCst);
                            return;
                        }
                    }
                }
                last_refresh = Instant::now();
            }
        }
    }

    /// Apply pending watch deltas to the record cache. Returns whether
    /// anything changed.
    fn drain_watch(
        &self,
        rx: &Receiver<WatchEvent>,
        cache: &mut HashMap<String, MappingRecord>,
    ) -> bool {
        let mut dirty = false;
        let mut event = rx.recv_timeout(Duration::from_millis(50));
        while let Ok(ev) = event {
            match ev.op {
                WatchOp::Put => match MappingRecord::from_bytes(&ev.value) {
                    Ok(record) => {
                        cache.insert(ev.key, record);
                        dirty = true;
                    }
                    Err(e) => warn!("Ignoring unparseable record at {}: {}", ev.key, e),
                },
                WatchOp::Delete => {
                    dirty |= cache.remove(&ev.key).is_some();
                }
            }
            event = rx.try_recv().map_err(|_| RecvTimeoutError::Timeout);
        }
        dirty
    }

    fn full_sync(&self, cache: &mut HashMap<String, MappingRecord>) -> Result<()> {
        let mut fresh = HashMap::new();
        for (key, data) in self.store.list(&self.nodes_prefix())? {
            match MappingRecord::from_bytes(&data) {
                Ok(record) => {
                    fresh.insert(key, record);
                }
                Err(e) => warn!("Ignoring unparseable record at {}: {}", key, e),
            }
        }
        *cache = fresh;
        Ok(())
    }

    fn rebuild(&self, cache: &HashMap<String, MappingRecord>, router: &RouteTable) {
        let now = now_unix();
        let mappings: Vec<Mapping> = cache
            .values()
            .filter(|record| record.expires_at > now)
            .filter_map(
                |record| match Mapping::from_record(record, &self.keypair.secret) {
                    Ok(mapping) => Some(mapping),
                    Err(e) => {
                        warn!("Dropping underivable mapping for {}: {}", record.private_ip, e);
                        None
                    }
                },
            )
            .collect();
        router.replace(mappings);
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}
