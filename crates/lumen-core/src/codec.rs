//! Format decode primitives.
//!
//! The pipeline treats codecs as black boxes: [`FormatCodec::probe_bounds`]
//! reads the header, [`FormatCodec::decode_pixels`] produces a (possibly
//! sampled, possibly region-cropped) raster in the stored orientation.
//! Orientation correction is applied by the decode stages, not the codec.

use std::io::Cursor;

use exif::{In, Reader, Tag};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};

use crate::error::DecodeError;
use crate::raster::{ImageInfo, Orientation, PixelFormat, RawBuffer, Region};

pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_PNG: &str = "image/png";
pub const MIME_GIF: &str = "image/gif";

/// Parameters of one pixel decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeParams {
    /// Power-of-two downsample factor; 1 decodes at full resolution.
    pub sample_size: u32,
    /// Area of the stored image to decode, in stored coordinates.
    pub region: Option<Region>,
    pub format: PixelFormat,
}

impl DecodeParams {
    pub fn new(format: PixelFormat) -> Self {
        Self {
            sample_size: 1,
            region: None,
            format,
        }
    }

    pub fn with_sample_size(mut self, sample_size: u32) -> Self {
        self.sample_size = sample_size.max(1);
        self
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }

    /// Dimensions of the raster produced from a `width`x`height` stored image.
    ///
    /// Every codec must produce exactly these dimensions, so the caller can
    /// size a pooled buffer before decoding.
    pub fn output_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let (w, h) = match self.region {
            Some(region) => (region.width, region.height),
            None => (width, height),
        };
        let sample = self.sample_size.max(1);
        (w.div_ceil(sample).max(1), h.div_ceil(sample).max(1))
    }
}

/// A family of image formats the pipeline can decode.
pub trait FormatCodec: Send + Sync {
    /// Whether this codec decodes `mime_type`.
    fn supports(&self, mime_type: &str) -> bool;

    /// Whether [`decode_pixels`](FormatCodec::decode_pixels) honours `region` for `mime_type`.
    fn supports_region(&self, mime_type: &str) -> bool;

    /// Read dimensions, MIME type and orientation without decoding pixels.
    fn probe_bounds(&self, bytes: &[u8]) -> Result<ImageInfo, DecodeError>;

    /// Decode pixels, writing into `reuse` when given.
    ///
    /// Implementations must fail with [`DecodeError::BufferReuseConflict`]
    /// rather than silently allocate when `reuse` cannot be used; the buffer
    /// is consumed either way.
    fn decode_pixels(
        &self,
        bytes: &[u8],
        params: &DecodeParams,
        reuse: Option<RawBuffer>,
    ) -> Result<RawBuffer, DecodeError>;
}

/// Default codec backed by the `image` crate (JPEG, PNG, GIF first frame).
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCodec;

impl ImageCodec {
    fn reader(bytes: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, DecodeError> {
        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| DecodeError::CorruptData(e.to_string()))?;
        match reader.format() {
            Some(ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Gif) => Ok(reader),
            Some(other) => Err(DecodeError::UnsupportedFormat(
                other.to_mime_type().to_string(),
            )),
            None => Err(DecodeError::UnsupportedFormat("unknown".to_string())),
        }
    }
}

impl FormatCodec for ImageCodec {
    fn supports(&self, mime_type: &str) -> bool {
        matches!(mime_type, MIME_JPEG | MIME_PNG | MIME_GIF)
    }

    fn supports_region(&self, mime_type: &str) -> bool {
        matches!(mime_type, MIME_JPEG | MIME_PNG)
    }

    fn probe_bounds(&self, bytes: &[u8]) -> Result<ImageInfo, DecodeError> {
        let reader = Self::reader(bytes)?;
        let mime_type = reader
            .format()
            .map(|format| format.to_mime_type())
            .unwrap_or("application/octet-stream");
        let orientation = if mime_type == MIME_GIF {
            Orientation::Normal
        } else {
            extract_orientation(bytes)
        };
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| DecodeError::CorruptData(e.to_string()))?;
        Ok(ImageInfo::new(width, height, mime_type).with_orientation(orientation))
    }

    fn decode_pixels(
        &self,
        bytes: &[u8],
        params: &DecodeParams,
        reuse: Option<RawBuffer>,
    ) -> Result<RawBuffer, DecodeError> {
        let mut img = Self::reader(bytes)?
            .decode()
            .map_err(|e| DecodeError::CorruptData(e.to_string()))?;

        if let Some(region) = params.region {
            if region.x + region.width > img.width() || region.y + region.height > img.height() {
                return Err(DecodeError::CorruptData(format!(
                    "region {region:?} outside {}x{} image",
                    img.width(),
                    img.height()
                )));
            }
            if !region.is_full(img.width(), img.height()) {
                img = img.crop_imm(region.x, region.y, region.width, region.height);
            }
        }

        let (width, height) = params.output_dimensions(img.width(), img.height());
        let img = downsample(img, width, height);
        RawBuffer::from_dynamic_image(img, params.format, reuse)
    }
}

fn downsample(img: DynamicImage, width: u32, height: u32) -> DynamicImage {
    if img.width() == width && img.height() == height {
        img
    } else {
        img.resize_exact(width, height, FilterType::Triangle)
    }
}

/// Extract EXIF orientation.
///
/// Returns `Orientation::Normal` if no EXIF data is found or orientation
/// cannot be determined.
fn extract_orientation(bytes: &[u8]) -> Orientation {
    let mut cursor = Cursor::new(bytes);
    match Reader::new().read_from_container(&mut cursor) {
        Ok(exif) => exif
            .get_field(Tag::Orientation, In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .map(Orientation::from)
            .unwrap_or_default(),
        Err(_) => Orientation::Normal,
    }
}
