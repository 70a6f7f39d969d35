//! The two result caches.
//!
//! - [`MemoryResourceCache`]: decoded buffers shared with consumers
//! - [`DiskTransformCache`]: encoded transformed results that survive restarts

mod disk;
mod memory;

pub use disk::{DiskCacheStats, DiskTransformCache};
pub use memory::{MemoryCacheStats, MemoryResourceCache};
