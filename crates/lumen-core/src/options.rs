//! Per-request decode options, cache policies and cache keys.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::process::ImageProcessor;
use crate::raster::PixelFormat;

/// How a single cache tier may be used by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Read hits and write results.
    #[default]
    Enabled,
    /// Neither read nor write.
    Disabled,
    /// Read hits, never write.
    ReadOnly,
    /// Write results, never read.
    WriteOnly,
}

impl CachePolicy {
    #[inline]
    pub fn can_read(self) -> bool {
        matches!(self, CachePolicy::Enabled | CachePolicy::ReadOnly)
    }

    #[inline]
    pub fn can_write(self) -> bool {
        matches!(self, CachePolicy::Enabled | CachePolicy::WriteOnly)
    }
}

/// The deepest data-source tier a request is allowed to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum RequestDepth {
    /// Memory cache only.
    Memory,
    /// Memory, disk caches and local sources.
    Local,
    /// Anything, including the network.
    #[default]
    Network,
}

/// How the output dimensions relate to the requested resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResizeMode {
    /// Output is exactly `width`x`height`, upscaling if needed.
    #[default]
    ExactlySame,
    /// Output has the requested aspect ratio but is never larger than the source.
    AspectRatioSame,
}

/// Which part of the source is kept when aspect ratios differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScaleType {
    /// Keep the top/left part.
    Start,
    /// Keep the centre.
    #[default]
    Center,
    /// Keep the bottom/right part.
    End,
    /// Keep everything and stretch.
    Fill,
}

/// A requested output size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resize {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub mode: ResizeMode,
    #[serde(default)]
    pub scale: ScaleType,
}

impl Resize {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            mode: ResizeMode::default(),
            scale: ScaleType::default(),
        }
    }

    pub fn with_mode(mut self, mode: ResizeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_scale(mut self, scale: ScaleType) -> Self {
        self.scale = scale;
        self
    }

    fn key_segment(&self) -> String {
        let mode = match self.mode {
            ResizeMode::ExactlySame => "exactly",
            ResizeMode::AspectRatioSame => "ratio",
        };
        let scale = match self.scale {
            ScaleType::Start => "start",
            ScaleType::Center => "center",
            ScaleType::End => "end",
            ScaleType::Fill => "fill",
        };
        format!("resize({}x{},{mode},{scale})", self.width, self.height)
    }
}

/// Options of a single decode request.
///
/// Everything that changes the output pixels is part of the [`CacheKey`];
/// cache policies, depth and pooling are not.
#[derive(Clone)]
pub struct DecodeOptions {
    /// Upper bound of the decoded size, enforced by power-of-two sampling.
    pub max_size: Option<(u32, u32)>,
    /// Exact output size, applied in post-processing.
    pub resize: Option<Resize>,
    /// Pixel transform applied after decoding.
    pub processor: Option<Arc<dyn ImageProcessor>>,
    pub pixel_format: PixelFormat,
    /// Apply the EXIF orientation so the result is upright.
    pub correct_orientation: bool,
    /// Allow region decoding for resize targets with a very different aspect ratio.
    pub thumbnail_mode: bool,
    /// Trade sharpness for memory on sampled decodes.
    pub smaller_thumbnails: bool,
    pub memory_cache: CachePolicy,
    pub disk_cache: CachePolicy,
    pub depth: RequestDepth,
    /// Offer pooled buffers to the decoder.
    pub pooling: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_size: None,
            resize: None,
            processor: None,
            pixel_format: PixelFormat::default(),
            correct_orientation: true,
            thumbnail_mode: false,
            smaller_thumbnails: false,
            memory_cache: CachePolicy::Enabled,
            disk_cache: CachePolicy::Enabled,
            depth: RequestDepth::Network,
            pooling: true,
        }
    }
}

impl fmt::Debug for DecodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeOptions")
            .field("max_size", &self.max_size)
            .field("resize", &self.resize)
            .field("processor", &self.processor.as_ref().map(|p| p.key()))
            .field("pixel_format", &self.pixel_format)
            .field("correct_orientation", &self.correct_orientation)
            .field("thumbnail_mode", &self.thumbnail_mode)
            .field("smaller_thumbnails", &self.smaller_thumbnails)
            .field("memory_cache", &self.memory_cache)
            .field("disk_cache", &self.disk_cache)
            .field("depth", &self.depth)
            .field("pooling", &self.pooling)
            .finish()
    }
}

impl DecodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_size(mut self, width: u32, height: u32) -> Self {
        self.max_size = Some((width, height));
        self
    }

    pub fn resize(mut self, resize: Resize) -> Self {
        self.resize = Some(resize);
        self
    }

    pub fn processor(mut self, processor: impl ImageProcessor + 'static) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    pub fn pixel_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = format;
        self
    }

    /// Decode to a 3-byte format instead of RGBA.
    pub fn low_quality(self) -> Self {
        self.pixel_format(PixelFormat::Rgb8)
    }

    pub fn correct_orientation(mut self, enabled: bool) -> Self {
        self.correct_orientation = enabled;
        self
    }

    pub fn thumbnail_mode(mut self, enabled: bool) -> Self {
        self.thumbnail_mode = enabled;
        self
    }

    pub fn smaller_thumbnails(mut self, enabled: bool) -> Self {
        self.smaller_thumbnails = enabled;
        self
    }

    pub fn memory_cache(mut self, policy: CachePolicy) -> Self {
        self.memory_cache = policy;
        self
    }

    pub fn disk_cache(mut self, policy: CachePolicy) -> Self {
        self.disk_cache = policy;
        self
    }

    pub fn depth(mut self, depth: RequestDepth) -> Self {
        self.depth = depth;
        self
    }

    pub fn pooling(mut self, enabled: bool) -> Self {
        self.pooling = enabled;
        self
    }
}

/// Key identifying a source plus every option that determines output pixels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

const TRANSFORMED_NAMESPACE: &str = "transformed:";

/// Escape `#` (the option separator) and `%` in a source id.
///
/// Option segments always start with a literal `#`, so two different
/// `(source_id, options)` pairs can never render to the same key.
fn escape_source_id(source_id: &str) -> String {
    let mut escaped = String::with_capacity(source_id.len());
    for c in source_id.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '#' => escaped.push_str("%23"),
            c => escaped.push(c),
        }
    }
    escaped
}

impl CacheKey {
    /// Build the canonical key of `source_id` decoded with `options`.
    pub fn build(source_id: &str, options: &DecodeOptions) -> Self {
        let mut key = escape_source_id(source_id);
        if let Some((w, h)) = options.max_size {
            key.push_str(&format!("#maxSize({w}x{h})"));
        }
        if let Some(resize) = &options.resize {
            key.push('#');
            key.push_str(&resize.key_segment());
        }
        if options.thumbnail_mode {
            key.push_str("#thumbnail");
        }
        if options.smaller_thumbnails {
            key.push_str("#smaller");
        }
        if !options.correct_orientation {
            key.push_str("#noOrient");
        }
        if options.pixel_format != PixelFormat::default() {
            key.push_str("#fmt(");
            key.push_str(options.pixel_format.as_str());
            key.push(')');
        }
        if let Some(processor) = &options.processor {
            key.push_str("#proc(");
            key.push_str(&processor.key());
            key.push(')');
        }
        CacheKey(key)
    }

    /// The key of the transformed-result disk cache entry for this key.
    ///
    /// Lives in its own namespace so it never collides with source-fetch keys.
    pub fn transformed(&self) -> CacheKey {
        CacheKey(format!("{TRANSFORMED_NAMESPACE}{}", self.0))
    }

    pub fn is_transformed(&self) -> bool {
        self.0.starts_with(TRANSFORMED_NAMESPACE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        CacheKey(value.to_string())
    }
}
