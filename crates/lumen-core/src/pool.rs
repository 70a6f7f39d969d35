//! Size-bucketed pool of reusable pixel buffers.
//!
//! Decoding a large image needs a large buffer, and allocating a fresh one
//! for every decode is the main source of memory churn. The pool keeps
//! buffers released by dropped results and hands them to later decodes:
//!
//! 1. **Same size**: a buffer with exactly the required byte length
//! 2. **Larger size**: the smallest buffer no more than
//!    `max_oversize_factor` times larger; the decoder writes the logical
//!    pixels into its prefix
//!
//! A miss is never an error: callers fall back to a fresh allocation.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::BufferPoolConfig;
use crate::raster::{PixelFormat, RawBuffer};

/// How aggressively to give memory back under pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrimLevel {
    /// Shrink to half the budget.
    Moderate,
    /// Drop everything.
    Complete,
}

/// Counters describing pool behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub resident_bytes: u64,
    pub buffers: usize,
    pub hits: u64,
    pub misses: u64,
    pub accepted: u64,
    pub rejected: u64,
}

/// Buckets are keyed by pixel format and physical byte length.
type ClassKey = (PixelFormat, usize);

#[derive(Default)]
struct PoolState {
    classes: BTreeMap<ClassKey, VecDeque<Vec<u8>>>,
    stats: PoolStats,
}

impl PoolState {
    fn take(&mut self, key: ClassKey) -> Option<Vec<u8>> {
        let queue = self.classes.get_mut(&key)?;
        let storage = queue.pop_front()?;
        if queue.is_empty() {
            self.classes.remove(&key);
        }
        self.stats.resident_bytes -= storage.len() as u64;
        self.stats.buffers -= 1;
        Some(storage)
    }

    /// Drop buffers, largest classes first, until resident bytes fit `target`.
    fn shrink_to(&mut self, target: u64) {
        while self.stats.resident_bytes > target {
            let Some(key) = self.classes.keys().next_back().copied() else {
                break;
            };
            if self.take(key).is_none() {
                break;
            }
        }
    }
}

/// Thread-safe pool of reusable [`RawBuffer`] storage.
///
/// One lock guards all buckets; `acquire` and `release` never do I/O while
/// holding it.
pub struct BufferPool {
    config: BufferPoolConfig,
    state: Mutex<PoolState>,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Take a buffer able to hold `width`x`height` pixels in `format`.
    ///
    /// Exact size matches are preferred over larger buffers.
    pub fn acquire(&self, width: u32, height: u32, format: PixelFormat) -> Option<RawBuffer> {
        let required = RawBuffer::required_bytes(width, height, format);
        if required == 0 {
            return None;
        }
        let largest = required.saturating_mul(self.config.max_oversize_factor);

        let storage = {
            let mut state = self.state.lock();
            let exact = state.take((format, required));
            let found = exact.or_else(|| {
                if largest <= required {
                    return None;
                }
                let key = state
                    .classes
                    .range((format, required + 1)..=(format, largest))
                    .next()
                    .map(|(key, _)| *key)?;
                state.take(key)
            });
            if found.is_some() {
                state.stats.hits += 1;
            } else {
                state.stats.misses += 1;
            }
            found
        };

        match storage {
            Some(storage) => {
                tracing::trace!(
                    width,
                    height,
                    ?format,
                    capacity = storage.len(),
                    "Reusing pooled buffer"
                );
                RawBuffer::from_storage(width, height, format, storage).ok()
            }
            None => {
                tracing::trace!(width, height, ?format, "No pooled buffer available");
                None
            }
        }
    }

    /// Offer a buffer back to the pool.
    ///
    /// The buffer is dropped instead when it would push the pool over its
    /// byte budget or its size class is already full.
    pub fn release(&self, buffer: RawBuffer) {
        let format = buffer.format;
        let storage = buffer.into_storage();
        let len = storage.len();
        if len == 0 {
            return;
        }

        let mut state = self.state.lock();
        let over_budget = state.stats.resident_bytes + len as u64 > self.config.max_bytes;
        let class_full = state
            .classes
            .get(&(format, len))
            .is_some_and(|queue| queue.len() >= self.config.max_buffers_per_class);
        if over_budget || class_full {
            state.stats.rejected += 1;
            drop(state);
            tracing::debug!(bytes = len, over_budget, class_full, "Pool rejected buffer");
            return;
        }

        state
            .classes
            .entry((format, len))
            .or_default()
            .push_back(storage);
        state.stats.resident_bytes += len as u64;
        state.stats.buffers += 1;
        state.stats.accepted += 1;
    }

    /// Drop pooled buffers until at most `target` bytes remain.
    pub fn trim_to_size(&self, target: u64) {
        self.state.lock().shrink_to(target);
    }

    pub fn trim(&self, level: TrimLevel) {
        let target = match level {
            TrimLevel::Moderate => self.config.max_bytes / 2,
            TrimLevel::Complete => 0,
        };
        tracing::debug!(?level, target, "Trimming buffer pool");
        self.trim_to_size(target);
    }

    pub fn clear(&self) {
        self.trim(TrimLevel::Complete);
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }

    pub fn max_bytes(&self) -> u64 {
        self.config.max_bytes
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}


// ============================================================================
// Property-Based Tests
// ============================================================================

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(u32, u32),
        Release(u32, u32),
        Trim,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u32..=32, 1u32..=32).prop_map(|(w, h)| Op::Acquire(w, h)),
            (1u32..=32, 1u32..=32).prop_map(|(w, h)| Op::Release(w, h)),
            Just(Op::Trim),
        ]
    }

    proptest! {
        /// Property: the pool never holds more than its byte budget, and every
        /// acquired buffer can hold the requested pixels.
        #[test]
        fn prop_budget_and_capacity(ops in proptest::collection::vec(op_strategy(), 1..64)) {
            let pool = BufferPool::new(BufferPoolConfig {
                max_bytes: 8 * 1024,
                max_buffers_per_class: 4,
                max_oversize_factor: 4,
            });
            for op in ops {
                match op {
                    Op::Acquire(w, h) => {
                        if let Some(buf) = pool.acquire(w, h, PixelFormat::Rgba8) {
                            prop_assert!(buf.byte_len() >= RawBuffer::required_bytes(w, h, PixelFormat::Rgba8));
                            prop_assert_eq!((buf.width, buf.height), (w, h));
                        }
                    }
                    Op::Release(w, h) => pool.release(RawBuffer::allocate(w, h, PixelFormat::Rgba8)),
                    Op::Trim => pool.trim(TrimLevel::Moderate),
                }
                prop_assert!(pool.stats().resident_bytes <= pool.max_bytes());
            }
        }
    }
}
