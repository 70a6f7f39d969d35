//! Reference-counted handles to decoded pixel buffers.
//!
//! A decoded buffer has two kinds of holders:
//! - **live** holders: every [`ResourceHandle`] given to a consumer
//! - **cache** holders: the memory cache's own registration of the buffer
//!
//! The buffer is reclaimed (returned to the [`BufferPool`] or freed) exactly
//! once, when both counts have reached zero. Both kinds of holders keep the
//! shared allocation alive, so the reclaim happens in the allocation's
//! `Drop` and a buffer can never be handed out again while anyone can still
//! read it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::pool::BufferPool;
use crate::raster::{ImageInfo, PixelFormat, RawBuffer, TransformTag};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// What produced a buffer, kept with it so a memory cache hit can be
/// reported without decoding again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultMeta {
    pub info: ImageInfo,
    pub applied_transforms: Vec<TransformTag>,
}

/// The shared allocation behind every handle and cache entry of one buffer.
pub(crate) struct Resource {
    id: u64,
    buffer: RawBuffer,
    meta: OnceLock<ResultMeta>,
    live: AtomicUsize,
    cache_refs: AtomicUsize,
    recyclable: AtomicBool,
    pool: Option<Weak<BufferPool>>,
}

impl Resource {
    /// Register one cache reference.
    pub(crate) fn retain_cached(&self) {
        self.cache_refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one cache reference.
    pub(crate) fn release_cached(&self) {
        let previous = self.cache_refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "cache reference released twice");
    }

    pub(crate) fn live_refs(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn cache_refs(&self) -> usize {
        self.cache_refs.load(Ordering::Acquire)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        // Only reachable once every handle and cache entry is gone.
        debug_assert_eq!(self.live.load(Ordering::Acquire), 0);
        debug_assert_eq!(self.cache_refs.load(Ordering::Acquire), 0);

        let buffer = self.buffer.take();
        if !self.recyclable.load(Ordering::Acquire) {
            tracing::trace!(id = self.id, "Freeing non-recyclable buffer");
            return;
        }
        match self.pool.as_ref().and_then(Weak::upgrade) {
            Some(pool) => {
                tracing::trace!(id = self.id, bytes = buffer.byte_len(), "Recycling buffer");
                pool.release(buffer);
            }
            None => tracing::trace!(id = self.id, "Freeing buffer"),
        }
    }
}

/// A consumer's reference to a decoded buffer.
///
/// Cloning adds a live reference; dropping or calling
/// [`release`](ResourceHandle::release) removes it. Consumers must let go of
/// every handle once they stop displaying the image.
pub struct ResourceHandle {
    resource: Arc<Resource>,
}

impl ResourceHandle {
    /// Wrap a freshly produced buffer. The buffer returns to `pool` once reclaimed.
    pub fn new(buffer: RawBuffer, pool: Option<&Arc<BufferPool>>) -> Self {
        let resource = Arc::new(Resource {
            id: NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed),
            buffer,
            meta: OnceLock::new(),
            live: AtomicUsize::new(0),
            cache_refs: AtomicUsize::new(0),
            recyclable: AtomicBool::new(true),
            pool: pool.map(Arc::downgrade),
        });
        Self::from_resource(resource)
    }

    /// Create another live reference to a shared resource.
    pub(crate) fn from_resource(resource: Arc<Resource>) -> Self {
        resource.live.fetch_add(1, Ordering::AcqRel);
        Self { resource }
    }

    pub(crate) fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    /// Give up this reference. Equivalent to dropping the handle.
    pub fn release(self) {
        tracing::trace!(id = self.resource.id, "Releasing handle");
    }

    pub fn id(&self) -> u64 {
        self.resource.id
    }

    pub fn buffer(&self) -> &RawBuffer {
        &self.resource.buffer
    }

    pub fn pixels(&self) -> &[u8] {
        self.resource.buffer.pixels()
    }

    pub fn width(&self) -> u32 {
        self.resource.buffer.width
    }

    pub fn height(&self) -> u32 {
        self.resource.buffer.height
    }

    pub fn format(&self) -> PixelFormat {
        self.resource.buffer.format
    }

    /// Physical size of the buffer, which is what the memory cache accounts.
    pub fn byte_size(&self) -> u64 {
        self.resource.buffer.byte_len() as u64
    }

    /// Number of consumer handles currently alive, this one included.
    pub fn live_refs(&self) -> usize {
        self.resource.live_refs()
    }

    /// Number of memory cache entries holding this buffer.
    pub fn cache_refs(&self) -> usize {
        self.resource.cache_refs()
    }

    pub fn is_cached(&self) -> bool {
        self.cache_refs() > 0
    }

    /// Whether the buffer goes back to the pool when reclaimed.
    pub fn is_recyclable(&self) -> bool {
        self.resource.recyclable.load(Ordering::Acquire)
    }

    /// Control whether the buffer goes back to the pool when reclaimed.
    pub fn set_recyclable(&self, recyclable: bool) {
        self.resource.recyclable.store(recyclable, Ordering::Release);
    }

    /// Metadata attached when the result was produced, if any.
    pub fn meta(&self) -> Option<&ResultMeta> {
        self.resource.meta.get()
    }

    /// Attach result metadata. Only the first call has an effect.
    pub(crate) fn set_meta(&self, meta: ResultMeta) {
        let _ = self.resource.meta.set(meta);
    }

    /// Whether both handles refer to the same underlying buffer.
    pub fn same_resource(&self, other: &ResourceHandle) -> bool {
        Arc::ptr_eq(&self.resource, &other.resource)
    }
}

impl Clone for ResourceHandle {
    fn clone(&self) -> Self {
        Self::from_resource(Arc::clone(&self.resource))
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        let previous = self.resource.live.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "live reference released twice");
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.resource.id)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("format", &self.format())
            .field("live_refs", &self.live_refs())
            .field("cache_refs", &self.cache_refs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferPoolConfig;

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(BufferPoolConfig::default()))
    }

    #[test]
    fn test_clone_and_drop_track_live_refs() {
        let pool = pool();
        let handle = ResourceHandle::new(RawBuffer::allocate(4, 4, PixelFormat::Rgba8), Some(&pool));
        assert_eq!(handle.live_refs(), 1);

        let second = handle.clone();
        assert_eq!(handle.live_refs(), 2);
        assert!(handle.same_resource(&second));

        second.release();
        assert_eq!(handle.live_refs(), 1);
    }

    #[test]
    fn test_last_release_recycles_buffer() {
        let pool = pool();
        let handle = ResourceHandle::new(RawBuffer::allocate(4, 4, PixelFormat::Rgba8), Some(&pool));
        let copy = handle.clone();

        handle.release();
        assert_eq!(pool.stats().buffers, 0, "still held by a clone");

        copy.release();
        assert_eq!(pool.stats().buffers, 1);
        assert_eq!(pool.stats().resident_bytes, 64);
    }

    #[test]
    fn test_cache_ref_keeps_buffer_out_of_pool() {
        let pool = pool();
        let handle = ResourceHandle::new(RawBuffer::allocate(4, 4, PixelFormat::Rgba8), Some(&pool));
        let cached = Arc::clone(handle.resource());
        cached.retain_cached();

        handle.release();
        assert_eq!(pool.stats().buffers, 0, "cache still holds the buffer");

        cached.release_cached();
        drop(cached);
        assert_eq!(pool.stats().buffers, 1);
    }

    #[test]
    fn test_non_recyclable_buffer_is_freed() {
        let pool = pool();
        let handle = ResourceHandle::new(RawBuffer::allocate(4, 4, PixelFormat::Rgba8), Some(&pool));
        handle.set_recyclable(false);
        handle.release();
        assert_eq!(pool.stats().buffers, 0);
    }

    #[test]
    fn test_handle_outliving_pool() {
        let pool = pool();
        let handle = ResourceHandle::new(RawBuffer::allocate(2, 2, PixelFormat::L8), Some(&pool));
        drop(pool);
        assert_eq!(handle.pixels().len(), 4);
        handle.release();
    }

    #[test]
    fn test_meta_is_shared_and_set_once() {
        let handle = ResourceHandle::new(RawBuffer::allocate(1, 1, PixelFormat::L8), None);
        assert!(handle.meta().is_none());

        let info = ImageInfo::new(10, 10, "image/png");
        handle.set_meta(ResultMeta {
            info: info.clone(),
            applied_transforms: vec![TransformTag::Resized],
        });
        handle.set_meta(ResultMeta {
            info: ImageInfo::new(1, 1, "image/gif"),
            applied_transforms: Vec::new(),
        });

        let copy = handle.clone();
        let meta = copy.meta().unwrap();
        assert_eq!(meta.info, info);
        assert_eq!(meta.applied_transforms, vec![TransformTag::Resized]);
    }

    #[test]
    fn test_distinct_ids() {
        let a = ResourceHandle::new(RawBuffer::allocate(1, 1, PixelFormat::L8), None);
        let b = ResourceHandle::new(RawBuffer::allocate(1, 1, PixelFormat::L8), None);
        assert_ne!(a.id(), b.id());
        assert!(!a.same_resource(&b));
    }
}
