//! Bounded, reference-counted memory cache of decoded results.
//!
//! # Entry lifecycle
//!
//! A buffer moves through three states:
//! 1. **Cached**: registered here, possibly also held by consumers
//! 2. **Evicted but alive**: unregistered by eviction or removal while
//!    consumers still hold handles; the pixels stay valid for them
//! 3. **Dead**: no cache entry and no handle; the buffer is reclaimed
//!
//! # Eviction
//!
//! Eviction is strict LRU by last access. Entries nobody is displaying are
//! evicted first; if that is not enough to get back under budget, pinned
//! entries are unregistered too (moving them to state 2), so the accounted
//! resident size never exceeds the budget.

use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::handle::{Resource, ResourceHandle};
use crate::lock::{KeyGuard, KeyLocks};
use crate::options::CacheKey;
use crate::pool::TrimLevel;

/// Counters describing memory cache behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    /// Evictions of entries that consumers were still holding.
    pub pinned_evicted: u64,
    pub resident_bytes: u64,
    pub entries: usize,
}

/// One cached result. Holds the cache's reference to the buffer.
struct CacheEntry {
    resource: Arc<Resource>,
    size_bytes: u64,
    last_access: Instant,
}

impl CacheEntry {
    fn new(resource: Arc<Resource>, size_bytes: u64) -> Self {
        resource.retain_cached();
        Self {
            resource,
            size_bytes,
            last_access: Instant::now(),
        }
    }

    fn is_pinned(&self) -> bool {
        self.resource.live_refs() > 0
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        self.resource.release_cached();
    }
}

struct CacheState {
    entries: LruCache<CacheKey, CacheEntry>,
    resident_bytes: u64,
    stats: MemoryCacheStats,
}

impl CacheState {
    /// Unlink LRU entries until resident bytes fit `target`.
    ///
    /// Returns the removed entries so the caller can drop them after
    /// releasing the lock.
    fn evict_to(&mut self, target: u64) -> Vec<(CacheKey, CacheEntry)> {
        let mut victims = Vec::new();
        if self.resident_bytes <= target {
            return victims;
        }

        let mut projected = self.resident_bytes;
        let mut keys = Vec::new();
        // Least recently used first; unpinned entries are preferred.
        for (key, entry) in self.entries.iter().rev() {
            if projected <= target {
                break;
            }
            if !entry.is_pinned() {
                projected -= entry.size_bytes;
                keys.push(key.clone());
            }
        }
        if projected > target {
            for (key, entry) in self.entries.iter().rev() {
                if projected <= target {
                    break;
                }
                if entry.is_pinned() {
                    projected -= entry.size_bytes;
                    keys.push(key.clone());
                }
            }
        }

        for key in keys {
            if let Some(entry) = self.entries.pop(&key) {
                self.resident_bytes -= entry.size_bytes;
                self.stats.evictions += 1;
                if entry.is_pinned() {
                    self.stats.pinned_evicted += 1;
                }
                victims.push((key, entry));
            }
        }
        victims
    }
}

/// Thread-safe LRU cache of decoded buffers, bounded in bytes.
pub struct MemoryResourceCache {
    max_bytes: u64,
    state: Mutex<CacheState>,
    locks: KeyLocks,
}

impl MemoryResourceCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                resident_bytes: 0,
                stats: MemoryCacheStats::default(),
            }),
            locks: KeyLocks::new(),
        }
    }

    /// Look up `key`, returning a new live handle on a hit.
    pub fn get(&self, key: &CacheKey) -> Option<ResourceHandle> {
        let mut state = self.state.lock();
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = Instant::now();
                let handle = ResourceHandle::from_resource(Arc::clone(&entry.resource));
                state.stats.hits += 1;
                drop(state);
                tracing::trace!(%key, "Memory cache hit");
                Some(handle)
            }
            None => {
                state.stats.misses += 1;
                drop(state);
                tracing::trace!(%key, "Memory cache miss");
                None
            }
        }
    }

    /// Whether `key` is cached, without touching its recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains(key)
    }

    /// Register `handle` under `key`, evicting LRU entries to stay in budget.
    ///
    /// Returns false if the entry alone exceeds the whole budget and was
    /// not cached. Such results are never shared through the cache, so
    /// identical requests for them each decode. An existing entry for `key`
    /// is replaced.
    pub fn put(&self, key: CacheKey, handle: &ResourceHandle, size_bytes: u64) -> bool {
        if size_bytes > self.max_bytes {
            tracing::debug!(%key, size_bytes, max = self.max_bytes, "Entry larger than memory cache");
            return false;
        }

        let entry = CacheEntry::new(Arc::clone(handle.resource()), size_bytes);
        let (replaced, victims) = {
            let mut state = self.state.lock();
            let replaced = state.entries.put(key.clone(), entry);
            if let Some(old) = &replaced {
                state.resident_bytes -= old.size_bytes;
            }
            state.resident_bytes += size_bytes;
            state.stats.puts += 1;
            let victims = state.evict_to(self.max_bytes);
            (replaced, victims)
        };

        tracing::debug!(%key, size_bytes, "Memory cache put");
        for (victim, entry) in &victims {
            tracing::debug!(key = %victim, pinned = entry.is_pinned(), "Memory cache evicted");
        }
        drop(replaced);
        drop(victims);
        true
    }

    /// Unregister `key`. Consumers holding handles keep their pixels.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.entries.pop(key);
            if let Some(entry) = &removed {
                state.resident_bytes -= entry.size_bytes;
            }
            removed
        };
        let found = removed.is_some();
        if found {
            tracing::debug!(%key, "Memory cache removed");
        }
        found
    }

    /// Evict LRU entries until at most `target` bytes are resident.
    pub fn trim_to_size(&self, target: u64) {
        let victims = self.state.lock().evict_to(target);
        if !victims.is_empty() {
            tracing::debug!(count = victims.len(), target, "Memory cache trimmed");
        }
    }

    pub fn trim(&self, level: TrimLevel) {
        match level {
            TrimLevel::Moderate => self.trim_to_size(self.max_bytes / 2),
            TrimLevel::Complete => self.clear(),
        }
    }

    /// Unregister every entry.
    pub fn clear(&self) {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.resident_bytes = 0;
            let mut drained = Vec::with_capacity(state.entries.len());
            while let Some(item) = state.entries.pop_lru() {
                drained.push(item);
            }
            drained
        };
        tracing::debug!(count = drained.len(), "Memory cache cleared");
    }

    /// Serialize work on `key` across threads.
    ///
    /// The pipeline holds this across get-decode-put so that concurrent
    /// identical requests decode once.
    pub fn lock_key(&self, key: &CacheKey) -> KeyGuard<'_> {
        self.locks.lock(key)
    }

    pub fn resident_bytes(&self) -> u64 {
        self.state.lock().resident_bytes
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn stats(&self) -> MemoryCacheStats {
        let state = self.state.lock();
        MemoryCacheStats {
            resident_bytes: state.resident_bytes,
            entries: state.entries.len(),
            ..state.stats
        }
    }
}

impl std::fmt::Debug for MemoryResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryResourceCache")
            .field("max_bytes", &self.max_bytes)
            .field("stats", &self.stats())
            .finish()
    }
}


// ============================================================================
// Property-Based Tests
// ============================================================================
