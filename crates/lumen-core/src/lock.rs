//! Per-key mutexes.
//!
//! Requests for the same cache key are serialized through one mutex per key
//! while requests for different keys proceed in parallel. Entries are
//! created on first use and removed once no guard or waiter references them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

use crate::options::CacheKey;

/// Registry of per-key mutexes.
#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

/// Holds the lock of one key until dropped.
pub struct KeyGuard<'a> {
    owner: &'a KeyLocks,
    key: CacheKey,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock of `key` is held.
    pub fn lock(&self, key: &CacheKey) -> KeyGuard<'_> {
        let mutex = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = mutex.lock_arc();
        KeyGuard {
            owner: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys with a live mutex.
    pub fn active_keys(&self) -> usize {
        self.locks.lock().len()
    }

    fn cleanup(&self, key: &CacheKey) {
        let mut locks = self.locks.lock();
        // Only the registry's own reference left: nobody holds or waits.
        if locks
            .get(key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(key);
        }
    }
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Unlock first so the guard's reference to the mutex is gone.
        drop(self.guard.take());
        self.owner.cleanup(&self.key);
    }
}

impl std::fmt::Debug for KeyLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLocks")
            .field("active_keys", &self.active_keys())
            .finish()
    }
}
