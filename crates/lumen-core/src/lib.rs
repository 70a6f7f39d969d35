//! Lumen Core - Image decode-and-cache library
//!
//! This crate turns `(source, options)` requests into decoded, transformed
//! pixel buffers while bounding peak memory:
//! - a byte-budgeted LRU memory cache of reference-counted results
//! - a pool of reusable pixel buffers fed by reclaimed results
//! - a disk cache of transformed results, committed atomically
//! - a decode chain preferring cached transforms, then sharp region-cropped
//!   thumbnails, then sampled full decodes
//! - per-key de-duplication of concurrent identical requests

pub mod cache;
pub mod codec;
pub mod config;
pub mod decode;
pub mod encode;
pub mod engine;
pub mod error;
pub mod handle;
pub mod lock;
pub mod options;
pub mod pipeline;
pub mod pool;
pub mod process;
pub mod raster;
pub mod source;
pub mod worker;

pub use cache::{DiskCacheStats, DiskTransformCache, MemoryCacheStats, MemoryResourceCache};
pub use codec::{DecodeParams, FormatCodec, ImageCodec};
pub use config::{
    BufferPoolConfig, ConfigError, DecodeConfig, DiskCacheConfig, EngineConfig, MemoryCacheConfig,
    WorkerConfig,
};
pub use decode::{
    DecodeContext, DecodeInterceptorChain, DecodeRequest, DecodeResult, DecodeStage,
};
pub use engine::{Engine, EngineError};
pub use error::{CacheError, DecodeError, DecodeErrorKind, FetchError, PipelineError};
pub use handle::{ResourceHandle, ResultMeta};
pub use options::{
    CacheKey, CachePolicy, DecodeOptions, RequestDepth, Resize, ResizeMode, ScaleType,
};
pub use pipeline::RequestPipeline;
pub use pool::{BufferPool, PoolStats, TrimLevel};
pub use process::{FlipProcessor, GrayscaleProcessor, ImageProcessor, RotateProcessor};
pub use raster::{DataFrom, ImageInfo, Orientation, PixelFormat, RawBuffer, Region, TransformTag};
pub use source::{FetchedImage, FileFetcher, ImageFetcher, MemoryFetcher};
pub use worker::{RequestTask, WorkerPool};
