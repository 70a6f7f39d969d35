//! End-to-end request scenarios through [`Engine`].

use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{ImageFormat, Rgba, RgbaImage};
use lumen_core::{
    CacheKey, DataFrom, DecodeError, DecodeOptions, DecodeParams, DiskCacheConfig,
    DiskTransformCache, Engine, EngineConfig, FormatCodec, GrayscaleProcessor, ImageCodec,
    ImageInfo, MemoryFetcher, PipelineError, PixelFormat, RawBuffer, RequestDepth, Resize,
    TransformTag,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn encode(img: &RgbaImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

fn png(width: u32, height: u32) -> Vec<u8> {
    encode(&RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x * 7) as u8, (y * 13) as u8, ((x + y) * 3) as u8, 255])
    }))
}

fn solid_png(width: u32, height: u32, red: u8) -> Vec<u8> {
    encode(&RgbaImage::from_pixel(width, height, Rgba([red, 0, 0, 255])))
}

/// Wraps [`ImageCodec`], counting pixel decodes and optionally rejecting
/// offered buffers.
#[derive(Default)]
struct CountingCodec {
    inner: ImageCodec,
    decodes: AtomicUsize,
    reuse_rejections: AtomicUsize,
    /// Report a reuse conflict on every decode, even without an offered buffer.
    always_conflict: bool,
    delay: Duration,
}

impl CountingCodec {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn rejecting_reuse(times: usize) -> Self {
        Self {
            reuse_rejections: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    fn always_conflicting() -> Self {
        Self {
            always_conflict: true,
            ..Self::default()
        }
    }

    fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

impl FormatCodec for CountingCodec {
    fn supports(&self, mime_type: &str) -> bool {
        self.inner.supports(mime_type)
    }

    fn supports_region(&self, mime_type: &str) -> bool {
        self.inner.supports_region(mime_type)
    }

    fn probe_bounds(&self, bytes: &[u8]) -> Result<ImageInfo, DecodeError> {
        self.inner.probe_bounds(bytes)
    }

    fn decode_pixels(
        &self,
        bytes: &[u8],
        params: &DecodeParams,
        reuse: Option<RawBuffer>,
    ) -> Result<RawBuffer, DecodeError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.always_conflict {
            let (width, height) = params.output_dimensions(32, 32);
            return Err(DecodeError::BufferReuseConflict { width, height });
        }
        if let Some(buffer) = &reuse {
            let remaining = self.reuse_rejections.load(Ordering::SeqCst);
            if remaining > 0 {
                self.reuse_rejections.store(remaining - 1, Ordering::SeqCst);
                return Err(DecodeError::BufferReuseConflict {
                    width: buffer.width,
                    height: buffer.height,
                });
            }
        }
        self.inner.decode_pixels(bytes, params, reuse)
    }
}

struct Harness {
    engine: Engine,
    codec: Arc<CountingCodec>,
}

fn harness(codec: CountingCodec, config: EngineConfig) -> Harness {
    init_tracing();
    let fetcher = Arc::new(MemoryFetcher::new());
    fetcher.insert("img1", png(400, 400), DataFrom::Local);
    fetcher.insert("img2", png(32, 32), DataFrom::Local);
    for i in 0..5 {
        fetcher.insert(format!("tile{i}"), png(32, 32), DataFrom::Local);
    }
    let codec = Arc::new(codec);
    let engine = Engine::with_codec(config, fetcher, Arc::clone(&codec) as Arc<dyn FormatCodec>)
        .unwrap();
    Harness { engine, codec }
}

fn config_with_disk(dir: &Path) -> EngineConfig {
    EngineConfig::default().with_disk_cache(dir)
}

#[test]
fn test_concurrent_identical_requests_decode_once() {
    let mut config = EngineConfig::default();
    config.workers.threads = 4;
    let h = harness(CountingCodec::slow(Duration::from_millis(50)), config);
    let options = DecodeOptions::new().resize(Resize::new(16, 16));

    let tasks: Vec<_> = (0..8)
        .map(|_| h.engine.request("img2", options.clone()))
        .collect();
    let results: Vec<_> = tasks.into_iter().map(|task| task.wait().unwrap()).collect();

    assert_eq!(h.codec.decodes(), 1);
    let first = &results[0].buffer;
    assert!(results.iter().all(|r| r.buffer.same_resource(first)));
    assert_eq!(first.live_refs(), 8);
    assert_eq!(first.cache_refs(), 1);
}

#[test]
fn test_cold_then_warm_resize_and_grayscale() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(CountingCodec::default(), config_with_disk(dir.path()));
    let options = DecodeOptions::new()
        .resize(Resize::new(100, 100))
        .processor(GrayscaleProcessor);
    let key = CacheKey::build("img1", &options);

    let cold = h.engine.execute("img1", &options).unwrap();
    assert_eq!(cold.data_from, DataFrom::Local);
    assert_eq!((cold.buffer.width(), cold.buffer.height()), (100, 100));
    assert_eq!(h.codec.decodes(), 1);

    let disk = h.engine.disk_cache().unwrap();
    assert!(disk.exists(&key.transformed()));
    assert_eq!(disk.stats().writes, 1);
    let disk_reads = disk.stats().hits + disk.stats().misses;

    let warm = h.engine.execute("img1", &options).unwrap();
    assert_eq!(warm.data_from, DataFrom::Memory);
    assert!(warm.buffer.same_resource(&cold.buffer));
    assert_eq!(warm.applied_transforms, cold.applied_transforms);
    assert!(warm
        .applied_transforms
        .contains(&TransformTag::Processed("Grayscale".to_string())));
    assert_eq!(h.codec.decodes(), 1, "warm request must not decode");
    assert_eq!(disk.stats().hits + disk.stats().misses, disk_reads, "warm request must not touch disk");
}

#[test]
fn test_restarted_engine_serves_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let options = DecodeOptions::new()
        .resize(Resize::new(100, 100))
        .processor(GrayscaleProcessor);

    let first = harness(CountingCodec::default(), config_with_disk(dir.path()));
    let original = first.engine.execute("img1", &options).unwrap();
    let pixels = original.buffer.pixels().to_vec();
    drop(original);
    first.engine.shutdown();
    drop(first);

    let second = harness(CountingCodec::default(), config_with_disk(dir.path()));
    let result = second.engine.execute("img1", &options).unwrap();
    assert_eq!(result.data_from, DataFrom::DiskCache);
    assert_eq!(result.info.width, 400);
    assert_eq!(result.buffer.pixels(), pixels.as_slice());
    assert_eq!(second.codec.decodes(), 0);
}

#[test]
fn test_memory_only_request_on_cold_cache() {
    let h = harness(CountingCodec::default(), EngineConfig::default());
    let options = DecodeOptions::new().depth(RequestDepth::Memory);

    let result = h.engine.request("img1", options).wait();
    assert!(matches!(
        result,
        Err(PipelineError::DepthExceeded {
            allowed: RequestDepth::Memory,
            ..
        })
    ));
    assert_eq!(h.codec.decodes(), 0);
}

#[test]
fn test_reuse_conflict_retries_without_pooling() {
    let h = harness(CountingCodec::rejecting_reuse(1), EngineConfig::default());
    let pool = h.engine.buffer_pool();
    pool.release(RawBuffer::allocate(32, 32, PixelFormat::Rgba8));
    assert_eq!(pool.stats().accepted, 1);

    let result = h.engine.execute("img2", &DecodeOptions::new()).unwrap();
    assert_eq!((result.buffer.width(), result.buffer.height()), (32, 32));
    assert_eq!(h.codec.decodes(), 2);
    assert_eq!(pool.stats().hits, 1);
    assert!(!result.buffer.is_recyclable());

    // Neither the rejected buffer nor the retry's buffer comes back.
    result.release();
    h.engine.memory_cache().clear();
    assert_eq!(pool.stats().buffers, 0);
    assert_eq!(pool.stats().accepted, 1);
}

#[test]
fn test_retry_succeeds_when_every_offered_buffer_is_rejected() {
    let h = harness(CountingCodec::rejecting_reuse(usize::MAX), EngineConfig::default());
    h.engine
        .buffer_pool()
        .release(RawBuffer::allocate(32, 32, PixelFormat::Rgba8));

    // The retry offers no buffer, so it succeeds even though every offer is rejected.
    let result = h.engine.execute("img2", &DecodeOptions::new()).unwrap();
    assert_eq!(h.codec.decodes(), 2);
    assert_eq!(result.data_from, DataFrom::Local);
}

#[test]
fn test_reuse_conflict_on_retry_surfaces() {
    let h = harness(CountingCodec::always_conflicting(), EngineConfig::default());

    let result = h.engine.execute("img2", &DecodeOptions::new());
    assert!(matches!(
        result,
        Err(PipelineError::Decode(DecodeError::BufferReuseConflict { .. }))
    ));
    assert_eq!(h.codec.decodes(), 2, "retried exactly once");
    assert!(h.engine.memory_cache().is_empty());
}

#[test]
fn test_disabled_pooling_never_takes_pooled_buffers() {
    let h = harness(CountingCodec::default(), EngineConfig::default());
    let pool = h.engine.buffer_pool();
    pool.release(RawBuffer::allocate(16, 16, PixelFormat::Rgba8));
    pool.release(RawBuffer::allocate(16, 16, PixelFormat::Rgba8));

    let options = DecodeOptions::new()
        .resize(Resize::new(16, 16))
        .processor(GrayscaleProcessor)
        .pooling(false);
    let result = h.engine.execute("img2", &options).unwrap();
    assert_eq!((result.buffer.width(), result.buffer.height()), (16, 16));
    assert_eq!(pool.stats().hits, 0);
    assert_eq!(pool.stats().buffers, 2);

    result.release();
    h.engine.memory_cache().clear();
    assert_eq!(pool.stats().buffers, 2);
}

#[test]
fn test_source_ids_with_separator_do_not_share_results() {
    init_tracing();
    let fetcher = Arc::new(MemoryFetcher::new());
    fetcher.insert("a", solid_png(128, 128, 10), DataFrom::Local);
    fetcher.insert("a#maxSize(64x64)", solid_png(64, 64, 200), DataFrom::Local);
    let engine = Engine::new(EngineConfig::default(), fetcher).unwrap();

    let first = engine
        .execute("a", &DecodeOptions::new().max_size(64, 64))
        .unwrap();
    let second = engine
        .execute("a#maxSize(64x64)", &DecodeOptions::new())
        .unwrap();

    assert_eq!(first.buffer.pixels()[0], 10);
    assert_eq!(second.buffer.pixels()[0], 200);
    assert_eq!(second.data_from, DataFrom::Local);
    assert!(!second.buffer.same_resource(&first.buffer));
}

#[test]
fn test_disk_reads_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let disk = DiskTransformCache::open(&DiskCacheConfig::new(dir.path())).unwrap();
    let key = CacheKey::from("img1#resize").transformed();

    disk.write(&key, |sink| sink.write_all(&png(8, 8))).unwrap();
    let first = disk.open_read(&key).unwrap().unwrap();
    let second = disk.open_read(&key).unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(first, png(8, 8));
}

#[test]
fn test_memory_budget_never_exceeded() {
    let mut config = EngineConfig::default();
    // Room for three 32x32 RGBA results.
    config.memory_cache.max_bytes = 3 * 32 * 32 * 4;
    let h = harness(CountingCodec::default(), config);
    let memory = h.engine.memory_cache();

    for i in 0..5 {
        h.engine
            .execute(&format!("tile{i}"), &DecodeOptions::new())
            .unwrap()
            .release();
        assert!(memory.resident_bytes() <= memory.max_bytes());
    }
    assert_eq!(memory.len(), 3);
    assert_eq!(memory.stats().evictions, 2);
}

#[test]
fn test_buffer_reclaimed_only_after_all_holders_let_go() {
    let h = harness(CountingCodec::default(), EngineConfig::default());
    let pool = h.engine.buffer_pool();

    let a = h.engine.execute("img2", &DecodeOptions::new()).unwrap();
    let b = h.engine.execute("img2", &DecodeOptions::new()).unwrap();
    assert!(a.buffer.same_resource(&b.buffer));
    assert_eq!(a.buffer.live_refs(), 2);
    assert_eq!(a.buffer.cache_refs(), 1);

    a.release();
    b.release();
    assert_eq!(pool.stats().buffers, 0, "memory cache still holds the buffer");

    h.engine.memory_cache().clear();
    assert_eq!(pool.stats().buffers, 1);

    // The reclaimed buffer feeds the next decode of the same size.
    let c = h.engine.execute("tile0", &DecodeOptions::new()).unwrap();
    assert_eq!(pool.stats().hits, 1);
    assert_eq!(c.buffer.live_refs(), 1);
}

#[test]
fn test_cancelled_request_releases_its_handle() {
    let h = harness(
        CountingCodec::slow(Duration::from_millis(50)),
        EngineConfig::default(),
    );
    let task = h.engine.request("img2", DecodeOptions::new());
    task.cancel();
    assert!(task.is_cancelled());
    assert!(matches!(task.wait(), Err(PipelineError::Aborted)));

    let result = h.engine.execute("img2", &DecodeOptions::new()).unwrap();
    assert_eq!(result.buffer.live_refs(), 1);
}
