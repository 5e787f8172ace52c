//! Concurrent private-address routing table.
//!
//! The table is an immutable snapshot behind an atomic pointer: readers load
//! the pointer and look up without taking any lock, the single writer (the
//! store client) builds a fresh snapshot and swaps it in whole. An in-flight
//! lookup sees either the previous or the new snapshot, never a mix.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::Ipv4Net;
use tracing::{debug, warn};

use crate::mapping::Mapping;

/// One immutable routing snapshot.
struct RouteSet {
    table: HashMap<u32, Arc<Mapping>>,
    gateway: Option<Arc<Mapping>>,
}

/// Private address → mapping resolution with gateway fallback.
pub struct RouteTable {
    subnet: Ipv4Net,
    snapshot: ArcSwap<RouteSet>,
}

impl RouteTable {
    /// Create an empty table covering the given overlay subnet
    pub fn new(subnet: Ipv4Net) -> Self {
        Self {
            subnet,
            snapshot: ArcSwap::from_pointee(RouteSet {
                table: HashMap::new(),
                gateway: None,
            }),
        }
    }

    /// The overlay subnet this table routes for
    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    /// Resolve a destination private address to a peer mapping.
    ///
    /// A destination outside the overlay subnet resolves to the gateway
    /// mapping when one exists.
    pub fn resolve(&self, addr: [u8; 4]) -> Option<Arc<Mapping>> {
        let ip = Ipv4Addr::from(addr);
        let snap = self.snapshot.load();
        if !self.subnet.contains(&ip) {
            return snap.gateway.clone();
        }
        snap.table.get(&u32::from_be_bytes(addr)).cloned()
    }

    /// Resolve a source private address on the receive path. Symmetric with
    /// [`RouteTable::resolve`]: traffic from outside the overlay is only
    /// accepted when attributable to the gateway.
    pub fn resolve_source(&self, addr: [u8; 4]) -> Option<Arc<Mapping>> {
        self.resolve(addr)
    }

    /// Atomically install a new mapping set.
    ///
    /// Duplicate private addresses are resolved by lease tie-break before the
    /// snapshot goes live, so every installed snapshot satisfies the
    /// uniqueness invariant. The gateway slot is filled by the explicitly
    /// flagged mapping, tie-broken the same way when more than one claims it.
    pub fn replace(&self, mappings: Vec<Mapping>) {
        let mut table: HashMap<u32, Arc<Mapping>> = HashMap::with_capacity(mappings.len());
        let mut gateway: Option<Arc<Mapping>> = None;

        for mapping in mappings {
            let mapping = Arc::new(mapping);
            if mapping.gateway {
                match &gateway {
                    Some(current) if !mapping.supersedes(current) => {}
                    _ => gateway = Some(mapping.clone()),
                }
            }
            match table.get(&mapping.key()) {
                Some(current) if !mapping.supersedes(current) => {
                    warn!(
                        "Discarding stale mapping for {} owned by {}",
                        mapping.private_ip, mapping.machine_id
                    );
                }
                Some(current) => {
                    warn!(
                        "Mapping for {} superseded: {} -> {}",
                        mapping.private_ip, current.machine_id, mapping.machine_id
                    );
                    table.insert(mapping.key(), mapping);
                }
                None => {
                    table.insert(mapping.key(), mapping);
                }
            }
        }

        debug!(
            "Installing routing snapshot: {} mappings, gateway {:?}",
            table.len(),
            gateway.as_ref().map(|g| g.private_ip)
        );
        self.snapshot.store(Arc::new(RouteSet { table, gateway }));
    }

    /// Number of mappings in the live snapshot
    pub fn len(&self) -> usize {
        self.snapshot.load().table.len()
    }

    /// Whether the live snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
