//! Per-key mutual exclusion for dedup resolution
//!
//! Resolutions for the same dedup key serialize; resolutions for different keys
//! proceed in parallel. The table itself is behind a read-write lock so lookups of
//! existing keys never contend with each other. A key's entry is dropped again
//! once no caller holds or waits on its lock.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Lock table keyed by dedup key.
pub struct KeyLockManager {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLockManager {
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the lock for `key`.
    ///
    /// Callers hold the returned `Arc` and lock it for the duration of their
    /// critical section.
    pub fn get_lock(&self, key: &str) -> Arc<Mutex<()>> {
        {
            let map = self.locks.read();
            if let Some(lock) = map.get(key) {
                return Arc::clone(lock);
            }
        }

        let mut map = self.locks.write();
        // Another thread may have inserted between the two acquisitions.
        Arc::clone(
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with_lock<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.get_lock(key);
        let result = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        self.prune(key);
        result
    }

    /// Forget `key` if the table holds the only reference to its lock.
    ///
    /// New references are only handed out under the read lock, so the count
    /// cannot grow while the write lock is held.
    fn prune(&self, key: &str) {
        let mut map = self.locks.write();
        if map
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(key);
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KeyLockManager {
    fn default() -> Self {
        Self::new()
    }
}
