//! Core raster types shared by every stage of the pipeline.

use image::{DynamicImage, GenericImageView, Pixel};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::options::RequestDepth;

/// EXIF orientation values (1-8).
/// See: https://exiftool.org/TagNames/EXIF.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Orientation {
    /// Normal (no transformation needed).
    #[default]
    Normal = 1,
    /// Horizontal flip.
    FlipHorizontal = 2,
    /// Rotate 180 degrees.
    Rotate180 = 3,
    /// Vertical flip.
    FlipVertical = 4,
    /// Transpose (flip horizontal + rotate 270 CW).
    Transpose = 5,
    /// Rotate 90 degrees clockwise.
    Rotate90CW = 6,
    /// Transverse (flip horizontal + rotate 90 CW).
    Transverse = 7,
    /// Rotate 270 degrees clockwise (90 CCW).
    Rotate270CW = 8,
}

impl Orientation {
    /// Returns true if this orientation swaps width and height dimensions.
    #[inline]
    pub fn swaps_dimensions(self) -> bool {
        matches!(
            self,
            Orientation::Transpose
                | Orientation::Rotate90CW
                | Orientation::Transverse
                | Orientation::Rotate270CW
        )
    }

    /// Dimensions of a `width`x`height` stored image once displayed upright.
    pub fn upright_dimensions(self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_dimensions() {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// Source coordinate in the stored image for upright pixel `(x, y)`.
    ///
    /// `width` and `height` are the stored (raw) dimensions.
    #[inline]
    fn source_coord(self, x: u32, y: u32, width: u32, height: u32) -> (u32, u32) {
        match self {
            Orientation::Normal => (x, y),
            Orientation::FlipHorizontal => (width - 1 - x, y),
            Orientation::Rotate180 => (width - 1 - x, height - 1 - y),
            Orientation::FlipVertical => (x, height - 1 - y),
            Orientation::Transpose => (y, x),
            Orientation::Rotate90CW => (y, height - 1 - x),
            Orientation::Transverse => (width - 1 - y, height - 1 - x),
            Orientation::Rotate270CW => (width - 1 - y, x),
        }
    }

    /// Map a region given in upright coordinates back to stored coordinates.
    ///
    /// `width` and `height` are the stored (raw) dimensions of the image.
    pub fn map_region_to_raw(self, region: Region, width: u32, height: u32) -> Region {
        let Region {
            x,
            y,
            width: w,
            height: h,
        } = region;
        match self {
            Orientation::Normal => region,
            Orientation::FlipHorizontal => Region::new(width - (x + w), y, w, h),
            Orientation::Rotate180 => Region::new(width - (x + w), height - (y + h), w, h),
            Orientation::FlipVertical => Region::new(x, height - (y + h), w, h),
            Orientation::Transpose => Region::new(y, x, h, w),
            Orientation::Rotate90CW => Region::new(y, height - (x + w), h, w),
            Orientation::Transverse => Region::new(width - (y + h), height - (x + w), h, w),
            Orientation::Rotate270CW => Region::new(width - (y + h), x, h, w),
        }
    }

    /// Write the upright version of `src` into `out`.
    ///
    /// `out` must already be shaped to the upright dimensions and the same
    /// pixel format as `src`.
    pub fn apply(self, src: &RawBuffer, out: &mut RawBuffer) {
        let bpp = src.format.bytes_per_pixel();
        let (sw, sh) = (src.width, src.height);
        debug_assert_eq!((out.width, out.height), self.upright_dimensions(sw, sh));
        debug_assert_eq!(out.format, src.format);

        let src_pixels = src.pixels();
        let out_width = out.width;
        let dst = out.pixels_mut();
        for (i, dst_px) in dst.chunks_exact_mut(bpp).enumerate() {
            let x = i as u32 % out_width;
            let y = i as u32 / out_width;
            let (sx, sy) = self.source_coord(x, y, sw, sh);
            let offset = (sy as usize * sw as usize + sx as usize) * bpp;
            dst_px.copy_from_slice(&src_pixels[offset..offset + bpp]);
        }
    }
}

impl From<u32> for Orientation {
    fn from(value: u32) -> Self {
        match value {
            1 => Orientation::Normal,
            2 => Orientation::FlipHorizontal,
            3 => Orientation::Rotate180,
            4 => Orientation::FlipVertical,
            5 => Orientation::Transpose,
            6 => Orientation::Rotate90CW,
            7 => Orientation::Transverse,
            8 => Orientation::Rotate270CW,
            _ => Orientation::Normal,
        }
    }
}

/// In-memory pixel layout of a decoded raster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum PixelFormat {
    /// 8-bit RGBA, 4 bytes per pixel.
    #[default]
    Rgba8,
    /// 8-bit RGB, 3 bytes per pixel. Used for low-quality requests.
    Rgb8,
    /// 8-bit luminance, 1 byte per pixel.
    L8,
}

impl PixelFormat {
    #[inline]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
            PixelFormat::L8 => 1,
        }
    }

    /// Short stable name used in cache keys.
    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Rgba8 => "rgba8",
            PixelFormat::Rgb8 => "rgb8",
            PixelFormat::L8 => "l8",
        }
    }
}

/// Where the pixels of a result ultimately came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFrom {
    Network,
    DiskCache,
    Memory,
    Local,
}

impl DataFrom {
    /// The request depth needed to reach this tier.
    pub fn depth(self) -> RequestDepth {
        match self {
            DataFrom::Memory => RequestDepth::Memory,
            DataFrom::DiskCache | DataFrom::Local => RequestDepth::Local,
            DataFrom::Network => RequestDepth::Network,
        }
    }
}

/// A transform that has been applied to a result's pixels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformTag {
    /// Decoded with a power-of-two sample size greater than 1.
    Sampled(u32),
    /// Only a region of the source was decoded.
    RegionCropped,
    /// EXIF orientation was applied.
    OrientationCorrected,
    /// Resized to the requested dimensions.
    Resized,
    /// A processor ran; carries the processor key.
    Processed(String),
}

/// Metadata of the original source image. Immutable once probed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Stored width in pixels (before orientation correction).
    pub width: u32,
    /// Stored height in pixels (before orientation correction).
    pub height: u32,
    /// MIME type of the source encoding, e.g. `image/jpeg`.
    pub mime_type: String,
    /// EXIF orientation.
    pub orientation: Orientation,
}

impl ImageInfo {
    pub fn new(width: u32, height: u32, mime_type: impl Into<String>) -> Self {
        Self {
            width,
            height,
            mime_type: mime_type.into(),
            orientation: Orientation::Normal,
        }
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    /// Get the effective dimensions after orientation correction.
    pub fn oriented_dimensions(&self) -> (u32, u32) {
        self.orientation.upright_dimensions(self.width, self.height)
    }
}

/// A rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether this region covers an entire `width`x`height` image.
    pub fn is_full(&self, width: u32, height: u32) -> bool {
        self.x == 0 && self.y == 0 && self.width == width && self.height == height
    }
}

/// A raw pixel buffer.
///
/// `data.len()` is the physical size class of the storage and may be larger
/// than `width * height * bpp` when a pooled buffer was reused; the logical
/// pixels are always the prefix returned by [`RawBuffer::pixels`].
#[derive(Debug)]
pub struct RawBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    data: Vec<u8>,
}

impl RawBuffer {
    /// Number of bytes needed for `width`x`height` pixels in `format`.
    #[inline]
    pub fn required_bytes(width: u32, height: u32, format: PixelFormat) -> usize {
        width as usize * height as usize * format.bytes_per_pixel()
    }

    /// Allocate fresh zeroed storage of exactly the required size.
    pub fn allocate(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            data: vec![0u8; Self::required_bytes(width, height, format)],
        }
    }

    /// Wrap existing storage, which must be large enough for the pixels.
    pub fn from_storage(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, DecodeError> {
        let required = Self::required_bytes(width, height, format);
        if data.len() < required {
            return Err(DecodeError::OutputTooSmall {
                required,
                available: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// Reinterpret the storage for new dimensions, keeping its size class.
    pub fn reshape(
        self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self, DecodeError> {
        Self::from_storage(width, height, format, self.data)
    }

    /// Physical size of the storage in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Logical size of the pixels in bytes.
    #[inline]
    pub fn pixel_bytes(&self) -> usize {
        Self::required_bytes(self.width, self.height, self.format)
    }

    #[inline]
    pub fn pixels(&self) -> &[u8] {
        &self.data[..self.pixel_bytes()]
    }

    #[inline]
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        let len = self.pixel_bytes();
        &mut self.data[..len]
    }

    /// Release the storage, e.g. to hand it back to a pool.
    pub fn into_storage(self) -> Vec<u8> {
        self.data
    }

    /// Move the storage out, leaving this buffer empty.
    pub(crate) fn take(&mut self) -> RawBuffer {
        RawBuffer {
            width: self.width,
            height: self.height,
            format: self.format,
            data: std::mem::take(&mut self.data),
        }
    }

    /// Copy the logical pixels into an `image` crate buffer.
    pub fn to_dynamic_image(&self) -> Option<DynamicImage> {
        let pixels = self.pixels().to_vec();
        match self.format {
            PixelFormat::Rgba8 => {
                image::RgbaImage::from_raw(self.width, self.height, pixels).map(DynamicImage::from)
            }
            PixelFormat::Rgb8 => {
                image::RgbImage::from_raw(self.width, self.height, pixels).map(DynamicImage::from)
            }
            PixelFormat::L8 => {
                image::GrayImage::from_raw(self.width, self.height, pixels).map(DynamicImage::from)
            }
        }
    }

    /// Convert a decoded image into `format`, writing into `reuse` when given.
    ///
    /// Pixels are converted straight into the reused storage, without an
    /// intermediate copy of the whole image. Returns `BufferReuseConflict` if
    /// `reuse` cannot hold the pixels.
    pub fn from_dynamic_image(
        img: DynamicImage,
        format: PixelFormat,
        reuse: Option<RawBuffer>,
    ) -> Result<Self, DecodeError> {
        let (width, height) = (img.width(), img.height());
        let Some(buffer) = reuse else {
            let bytes = match format {
                PixelFormat::Rgba8 => img.into_rgba8().into_raw(),
                PixelFormat::Rgb8 => img.into_rgb8().into_raw(),
                PixelFormat::L8 => img.into_luma8().into_raw(),
            };
            return Self::from_storage(width, height, format, bytes);
        };

        if buffer.byte_len() < Self::required_bytes(width, height, format) {
            return Err(DecodeError::BufferReuseConflict { width, height });
        }
        let mut out = buffer.reshape(width, height, format)?;
        write_converted(&img, format, out.pixels_mut());
        Ok(out)
    }
}

/// Write `img` as `format` pixels into `dst`, which holds exactly its pixels.
fn write_converted(img: &DynamicImage, format: PixelFormat, dst: &mut [u8]) {
    let native = match (format, img) {
        (PixelFormat::Rgba8, DynamicImage::ImageRgba8(buf)) => Some(buf.as_raw()),
        (PixelFormat::Rgb8, DynamicImage::ImageRgb8(buf)) => Some(buf.as_raw()),
        (PixelFormat::L8, DynamicImage::ImageLuma8(buf)) => Some(buf.as_raw()),
        _ => None,
    };
    if let Some(src) = native {
        dst.copy_from_slice(src);
        return;
    }

    let bpp = format.bytes_per_pixel();
    for ((_, _, px), out) in img.pixels().zip(dst.chunks_exact_mut(bpp)) {
        match format {
            PixelFormat::Rgba8 => out.copy_from_slice(&px.0),
            PixelFormat::Rgb8 => out.copy_from_slice(&px.to_rgb().0),
            PixelFormat::L8 => out[0] = px.to_luma().0[0],
        }
    }
}
