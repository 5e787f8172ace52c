//! In-process store backend.
//!
//! Implements the full adapter contract (TTL expiry, create-if-absent,
//! prefix watches, the network lock) against process-local state.
//! Serves single-node operation and every test that needs a control plane.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::store::{LockHandle, Store, WatchEvent, WatchOp};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

struct Lock {
    token: u64,
    expires_at: Instant,
}

struct Watcher {
    prefix: String,
    sender: Sender<WatchEvent>,
}

/// The in-memory backend
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    locks: Mutex<HashMap<String, Lock>>,
    watchers: Mutex<Vec<Watcher>>,
    next_token: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail, to exercise lease-loss handling.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Store("backend unavailable".into()));
        }
        Ok(())
    }

    /// Drop expired entries, emitting delete events for watchers.
    fn sweep(&self) {
        let now = Instant::now();
        let mut data = self.data.lock().unwrap();
        let expired: Vec<String> = data
            .iter()
            .filter(|(_, e)| e.expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            data.remove(&key);
            self.notify(&key, Vec::new(), WatchOp::Delete);
        }
    }

    fn notify(&self, key: &str, value: Vec<u8>, op: WatchOp) {
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|w| {
            if !key.starts_with(&w.prefix) {
                return true;
            }
            w.sender
                .send(WatchEvent {
                    key: key.to_string(),
                    value: value.clone(),
                    op,
                })
                .is_ok()
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.sweep();
        Ok(self
            .data
            .lock()
            .unwrap()
            .get(key)
            .map(|e| e.value.clone()))
    }

    fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.check_writable()?;
        self.data.lock().unwrap().insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        self.notify(key, value.to_vec(), WatchOp::Put);
        Ok(())
    }

    fn create_if_absent(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool> {
        self.check_writable()?;
        self.sweep();
        {
            let mut data = self.data.lock().unwrap();
            if data.contains_key(key) {
                return Ok(false);
            }
            data.insert(
                key.to_string(),
                Entry {
                    value: value.to_vec(),
                    expires_at: ttl.map(|t| Instant::now() + t),
                },
            );
        }
        self.notify(key, value.to_vec(), WatchOp::Put);
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        if self.data.lock().unwrap().remove(key).is_some() {
            self.notify(key, Vec::new(), WatchOp::Delete);
        }
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.sweep();
        Ok(self
            .data
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    fn watch(&self, prefix: &str) -> Result<Receiver<WatchEvent>> {
        let (sender, receiver) = channel();
        self.watchers.lock().unwrap().push(Watcher {
            prefix: prefix.to_string(),
            sender,
        });
        Ok(receiver)
    }

    fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<LockHandle> {
        self.check_writable()?;
        let now = Instant::now();
        let mut locks = self.locks.lock().unwrap();
        if let Some(lock) = locks.get(key) {
            if lock.expires_at > now {
                return Err(Error::LockHeld(key.to_string()));
            }
        }
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        locks.insert(
            key.to_string(),
            Lock {
                token,
                expires_at: now + ttl,
            },
        );
        Ok(LockHandle {
            key: key.to_string(),
            token,
        })
    }

    fn release_lock(&self, handle: LockHandle) -> Result<()> {
        let mut locks = self.locks.lock().unwrap();
        if let Some(lock) = locks.get(&handle.key) {
            if lock.token == handle.token {
                locks.remove(&handle.key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .put("shroud/nodes/a", b"1", Some(Duration::from_millis(20)))
            .unwrap();
        assert!(store.get("shroud/nodes/a").unwrap().is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(store.get("shroud/nodes/a").unwrap().is_none());
        assert!(store.list("shroud/nodes/").unwrap().is_empty());
    }

    #[test]
    fn test_create_if_absent() {
        let store = MemoryStore::new();
        assert!(store.create_if_absent("k", b"first", None).unwrap());
        assert!(!store.create_if_absent("k", b"second", None).unwrap());
        assert_eq!(store.get("k").unwrap().unwrap(), b"first");
    }

    #[test]
    fn test_watch_sees_puts_and_deletes() {
        let store = MemoryStore::new();
        let rx = store.watch("shroud/nodes/").unwrap();

        store.put("shroud/nodes/a", b"1", None).unwrap();
        store.put("shroud/config/network", b"ignored", None).unwrap();
        store.delete("shroud/nodes/a").unwrap();

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.key, "shroud/nodes/a");
        assert_eq!(first.op, WatchOp::Put);
        assert_eq!(first.value, b"1");

        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(second.op, WatchOp::Delete);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_lock_exclusion_and_expiry() {
        let store = MemoryStore::new();
        let handle = store
            .acquire_lock("shroud/locks/network", Duration::from_millis(30))
            .unwrap();
        assert!(matches!(
            store.acquire_lock("shroud/locks/network", Duration::from_secs(1)),
            Err(Error::LockHeld(_))
        ));

        // A dead holder's lock expires.
        std::thread::sleep(Duration::from_millis(50));
        let second = store
            .acquire_lock("shroud/locks/network", Duration::from_secs(1))
            .unwrap();

        // Releasing the stale handle must not free the new holder's lock.
        store.release_lock(handle).unwrap();
        assert!(store
            .acquire_lock("shroud/locks/network", Duration::from_secs(1))
            .is_err());
        store.release_lock(second).unwrap();
    }

    #[test]
    fn test_write_failure_injection() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.put("k", b"v", None).is_err());
        store.set_fail_writes(false);
        assert!(store.put("k", b"v", None).is_ok());
    }
}
