//! The decode interceptor chain.
//!
//! A request is decoded by the first matching stage, tried in fixed
//! priority order:
//!
//! 1. [`TransformCacheProbe`]: a committed transformed result on disk
//! 2. [`ThumbnailRegionDecode`]: a sharper, region-cropped thumbnail
//! 3. [`FormatDecode`]: a full (sampled) decode of the source
//!
//! The produced result then runs through [`PostProcess`] (resize, processor,
//! disk cache write) unless it is final. A stage that fails only because the
//! disk cache could not serve its entry is skipped and the next matching
//! stage runs instead.
//!
//! # Examples
//!
//! ```ignore
//! let chain = DecodeInterceptorChain::new(context);
//! let info = chain.probe(&source)?;
//! let result = chain.decode(&DecodeRequest::new(&key, &source, &info, &options))?;
//! ```

mod post;
mod sample;
mod stages;

use std::sync::Arc;

use crate::cache::DiskTransformCache;
use crate::codec::{DecodeParams, FormatCodec};
use crate::config::DecodeConfig;
use crate::error::{DecodeError, PipelineError};
use crate::handle::ResourceHandle;
use crate::options::{CacheKey, DecodeOptions};
use crate::pool::BufferPool;
use crate::process::output_buffer;
use crate::raster::{DataFrom, ImageInfo, Orientation, PixelFormat, RawBuffer, TransformTag};
use crate::source::FetchedImage;

pub use post::PostProcess;
pub use sample::{aspect_mismatch, calculate_sample_size};
pub use stages::{FormatDecode, ThumbnailRegionDecode, TransformCacheProbe};

/// The outcome of a successful decode.
#[derive(Debug)]
pub struct DecodeResult {
    pub buffer: ResourceHandle,
    /// Metadata of the original source.
    pub info: ImageInfo,
    pub data_from: DataFrom,
    /// Transforms applied to `buffer`, in order, without duplicates.
    pub applied_transforms: Vec<TransformTag>,
    /// No further processing may be applied.
    pub is_final: bool,
}

impl DecodeResult {
    pub fn new(buffer: ResourceHandle, info: ImageInfo, data_from: DataFrom) -> Self {
        Self {
            buffer,
            info,
            data_from,
            applied_transforms: Vec::new(),
            is_final: false,
        }
    }

    /// Record a transform, keeping insertion order and ignoring repeats.
    pub fn push_transform(&mut self, tag: TransformTag) {
        if !self.applied_transforms.contains(&tag) {
            self.applied_transforms.push(tag);
        }
    }

    pub fn finalized(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// Give up the result's buffer reference.
    pub fn release(self) {
        self.buffer.release();
    }
}

/// One decode attempt of one request.
#[derive(Debug, Clone, Copy)]
pub struct DecodeRequest<'a> {
    pub key: &'a CacheKey,
    pub source: &'a FetchedImage,
    /// Probed from the original source bytes.
    pub info: &'a ImageInfo,
    pub options: &'a DecodeOptions,
    /// Whether pooled buffers may be offered to the codec on this attempt.
    pub pooling: bool,
}

impl<'a> DecodeRequest<'a> {
    pub fn new(
        key: &'a CacheKey,
        source: &'a FetchedImage,
        info: &'a ImageInfo,
        options: &'a DecodeOptions,
    ) -> Self {
        Self {
            key,
            source,
            info,
            options,
            pooling: options.pooling,
        }
    }

    /// The orientation to correct, or `Normal` if none is needed.
    pub fn orientation(&self) -> Orientation {
        if self.options.correct_orientation {
            self.info.orientation
        } else {
            Orientation::Normal
        }
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.options.pixel_format
    }

    /// Source dimensions as they will be displayed.
    pub fn upright_dimensions(&self) -> (u32, u32) {
        self.orientation()
            .upright_dimensions(self.info.width, self.info.height)
    }

    /// Whether the result differs enough from the source to be worth caching
    /// on disk. Plain decodes would only duplicate the original bytes.
    pub fn is_transform_cacheable(&self) -> bool {
        self.options.resize.is_some()
            || self.options.processor.is_some()
            || self.orientation() != Orientation::Normal
    }

    /// Transforms a complete result of this request carries.
    pub fn expected_transforms(&self) -> Vec<TransformTag> {
        let mut tags = Vec::new();
        if self.orientation() != Orientation::Normal {
            tags.push(TransformTag::OrientationCorrected);
        }
        if self.options.resize.is_some() {
            tags.push(TransformTag::Resized);
        }
        if let Some(processor) = &self.options.processor {
            tags.push(TransformTag::Processed(processor.key()));
        }
        tags
    }
}

/// Shared collaborators of every stage.
pub struct DecodeContext {
    pub codec: Arc<dyn FormatCodec>,
    pub pool: Arc<BufferPool>,
    pub disk: Option<Arc<DiskTransformCache>>,
    pub config: DecodeConfig,
}

impl DecodeContext {
    pub fn new(codec: Arc<dyn FormatCodec>, pool: Arc<BufferPool>, config: DecodeConfig) -> Self {
        Self {
            codec,
            pool,
            disk: None,
            config,
        }
    }

    pub fn with_disk_cache(mut self, disk: Arc<DiskTransformCache>) -> Self {
        self.disk = Some(disk);
        self
    }

    /// The buffer pool, if the attempt may draw from it.
    fn pool_for(&self, pooling: bool) -> Option<&BufferPool> {
        pooling.then_some(&*self.pool)
    }

    /// A pooled buffer for the attempt, if pooling is on and one fits.
    fn acquire(&self, width: u32, height: u32, format: PixelFormat, pooling: bool) -> Option<RawBuffer> {
        self.pool_for(pooling)?.acquire(width, height, format)
    }

    /// Hand an intermediate buffer back.
    fn recycle(&self, buffer: RawBuffer, pooling: bool) {
        if pooling {
            self.pool.release(buffer);
        }
    }

    /// Wrap fresh pixels in a handle that reclaims into the pool.
    fn wrap(&self, buffer: RawBuffer, pooling: bool) -> ResourceHandle {
        let handle = ResourceHandle::new(buffer, Some(&self.pool));
        handle.set_recyclable(pooling);
        handle
    }

    /// The disk cache, if `request` may read transformed results from it.
    fn readable_disk(&self, request: &DecodeRequest<'_>) -> Option<&DiskTransformCache> {
        let disk = self.disk.as_deref()?;
        (request.options.disk_cache.can_read() && request.is_transform_cacheable()).then_some(disk)
    }

    /// The disk cache, if `request`'s result may be written to it.
    fn writable_disk(&self, request: &DecodeRequest<'_>) -> Option<&DiskTransformCache> {
        let disk = self.disk.as_deref()?;
        (request.options.disk_cache.can_write() && request.is_transform_cacheable()).then_some(disk)
    }

    /// Decode source pixels, offering a pooled buffer sized to the sampled output.
    fn decode_source(
        &self,
        request: &DecodeRequest<'_>,
        params: &DecodeParams,
    ) -> Result<RawBuffer, DecodeError> {
        let (width, height) = params.output_dimensions(request.info.width, request.info.height);
        let reuse = self.acquire(width, height, params.format, request.pooling);
        if reuse.is_some() {
            tracing::trace!(key = %request.key, width, height, "Offering pooled buffer to codec");
        }
        self.codec
            .decode_pixels(&request.source.bytes, params, reuse)
    }

    /// Rotate/flip a raw decode upright if the request asks for it.
    fn correct_orientation(&self, raw: RawBuffer, request: &DecodeRequest<'_>) -> (RawBuffer, bool) {
        let orientation = request.orientation();
        if orientation == Orientation::Normal {
            return (raw, false);
        }
        let (width, height) = orientation.upright_dimensions(raw.width, raw.height);
        let mut upright = output_buffer(self.pool_for(request.pooling), width, height, raw.format);
        orientation.apply(&raw, &mut upright);
        self.recycle(raw, request.pooling);
        (upright, true)
    }
}

impl std::fmt::Debug for DecodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeContext")
            .field("pool", &self.pool)
            .field("disk", &self.disk)
            .field("config", &self.config)
            .finish()
    }
}

/// A step able to produce a [`DecodeResult`] for some requests.
pub trait DecodeStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this stage can serve `request`.
    fn matches(&self, ctx: &DecodeContext, request: &DecodeRequest<'_>) -> bool;

    fn decode(
        &self,
        ctx: &DecodeContext,
        request: &DecodeRequest<'_>,
    ) -> Result<DecodeResult, DecodeError>;
}

/// Ordered decode stages followed by post-processing.
pub struct DecodeInterceptorChain {
    ctx: DecodeContext,
    stages: Vec<Box<dyn DecodeStage>>,
}

impl DecodeInterceptorChain {
    /// The standard stage order.
    pub fn new(ctx: DecodeContext) -> Self {
        Self::with_stages(
            ctx,
            vec![
                Box::new(TransformCacheProbe),
                Box::new(ThumbnailRegionDecode),
                Box::new(FormatDecode),
            ],
        )
    }

    pub fn with_stages(ctx: DecodeContext, stages: Vec<Box<dyn DecodeStage>>) -> Self {
        Self { ctx, stages }
    }

    pub fn context(&self) -> &DecodeContext {
        &self.ctx
    }

    /// Read the metadata of the original source.
    pub fn probe(&self, source: &FetchedImage) -> Result<ImageInfo, DecodeError> {
        let info = self.ctx.codec.probe_bounds(&source.bytes)?;
        if let Some(declared) = &source.mime_type {
            if declared != &info.mime_type {
                tracing::debug!(
                    source = %source.identity,
                    declared,
                    probed = %info.mime_type,
                    "Declared MIME type differs from content"
                );
            }
        }
        Ok(info)
    }

    /// Run the first matching stage, then post-process its result.
    pub fn decode(&self, request: &DecodeRequest<'_>) -> Result<DecodeResult, PipelineError> {
        for stage in &self.stages {
            if !stage.matches(&self.ctx, request) {
                continue;
            }
            tracing::debug!(key = %request.key, stage = stage.name(), "Decode stage selected");
            match stage.decode(&self.ctx, request) {
                Ok(result) => return Ok(PostProcess.run(&self.ctx, request, result)?),
                Err(DecodeError::Cache(err)) => {
                    tracing::warn!(
                        key = %request.key,
                        stage = stage.name(),
                        error = %err,
                        "Disk cache entry unusable, falling through"
                    );
                }
                Err(err) => {
                    tracing::debug!(
                        key = %request.key,
                        stage = stage.name(),
                        kind = ?err.kind(),
                        "Decode stage failed"
                    );
                    return Err(err.into());
                }
            }
        }
        Err(PipelineError::NoMatchingStage)
    }
}

impl std::fmt::Debug for DecodeInterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(|stage| stage.name()).collect();
        f.debug_struct("DecodeInterceptorChain")
            .field("stages", &names)
            .field("ctx", &self.ctx)
            .finish()
    }
}
