//! Control-plane key/value store.
//!
//! Shroud keeps the overlay definition and the live peer set in a shared
//! store. [`Store`] is the adapter contract every backend offers; concrete
//! wire adapters (etcd, consul) plug in behind it, and the in-process
//! [`MemoryStore`] implements the full contract for single-node operation
//! and tests.
//!
//! Key layout, backend-agnostic:
//!
//! ```text
//! {prefix}/config/network      the overlay definition, JSON
//! {prefix}/nodes/{machine_id}  one mapping record per node, lease TTL
//! {prefix}/locks/network       distributed lock for network-level writes
//! ```

mod client;
mod memory;

pub use client::{LeaseState, StoreClient};
pub use memory::MemoryStore;

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};

/// TTL of the distributed network lock.
pub const LOCK_TTL: Duration = Duration::from_secs(10);

/// What happened to a watched key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOp {
    Put,
    Delete,
}

/// One change observed under a watched prefix
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub key: String,
    pub value: Vec<u8>,
    pub op: WatchOp,
}

/// Proof of lock ownership, consumed on release.
#[derive(Debug)]
pub struct LockHandle {
    pub(crate) key: String,
    pub(crate) token: u64,
}

/// The adapter contract for control-plane backends.
///
/// Implementations are expected to bound every call at roughly ten seconds;
/// the callers treat a slow store the same as a failed one.
pub trait Store: Send + Sync {
    /// Fetch a single key
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a key, with an optional TTL after which it expires
    fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Atomically create a key only if it does not exist. Returns `false`
    /// when the key was already present.
    fn create_if_absent(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool>;

    /// Delete a key
    fn delete(&self, key: &str) -> Result<()>;

    /// List all live keys under a prefix
    fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Subscribe to changes under a prefix
    fn watch(&self, prefix: &str) -> Result<Receiver<WatchEvent>>;

    /// Take the distributed lock at `key`, failing with [`Error::LockHeld`]
    /// when another holder is alive
    fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<LockHandle>;

    /// Release a previously acquired lock
    fn release_lock(&self, handle: LockHandle) -> Result<()>;
}

/// Construct the configured backend.
pub fn new(cfg: &Config) -> Result<Arc<dyn Store>> {
    match cfg.datastore.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "etcd" | "consul" => Err(Error::Config(format!(
            "datastore '{}' requires an external adapter; this build ships the in-memory backend only",
            cfg.datastore
        ))),
        other => Err(Error::Config(format!("unknown datastore '{}'", other))),
    }
}
