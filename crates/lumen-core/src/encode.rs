//! Encoding of transformed results for the disk cache.
//!
//! Entries are stored as PNG so that a disk hit reproduces the transformed
//! pixels exactly. Only the pixels are stored; image metadata is always
//! re-derived from the original source.

use std::io::{self, Cursor, Write};

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageFormat, ImageReader};
use thiserror::Error;

use crate::error::DecodeError;
use crate::raster::{PixelFormat, RawBuffer};

/// Errors that can occur while encoding a cache entry.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Width or height is zero
    #[error("Invalid dimensions: width ({width}) and height ({height}) must be non-zero")]
    InvalidDimensions { width: u32, height: u32 },

    /// PNG encoding failed
    #[error("PNG encoding failed: {0}")]
    EncodingFailed(String),
}

impl From<EncodeError> for io::Error {
    fn from(err: EncodeError) -> Self {
        io::Error::other(err)
    }
}

fn color_type(format: PixelFormat) -> ExtendedColorType {
    match format {
        PixelFormat::Rgba8 => ExtendedColorType::Rgba8,
        PixelFormat::Rgb8 => ExtendedColorType::Rgb8,
        PixelFormat::L8 => ExtendedColorType::L8,
    }
}

/// Encode the logical pixels of `buffer` as PNG into `sink`.
pub fn encode_png(buffer: &RawBuffer, sink: &mut dyn Write) -> Result<(), EncodeError> {
    if buffer.width == 0 || buffer.height == 0 {
        return Err(EncodeError::InvalidDimensions {
            width: buffer.width,
            height: buffer.height,
        });
    }
    PngEncoder::new(sink)
        .write_image(
            buffer.pixels(),
            buffer.width,
            buffer.height,
            color_type(buffer.format),
        )
        .map_err(|e| EncodeError::EncodingFailed(e.to_string()))
}

/// Decode a PNG cache entry into `format`.
///
/// `reuse` is asked for a buffer of the decoded dimensions only once the
/// entry decoded successfully, so a corrupt entry never takes one.
pub fn decode_png(
    bytes: &[u8],
    format: PixelFormat,
    reuse: impl FnOnce(u32, u32) -> Option<RawBuffer>,
) -> Result<RawBuffer, DecodeError> {
    let img = ImageReader::with_format(Cursor::new(bytes), ImageFormat::Png)
        .decode()
        .map_err(|e| DecodeError::CorruptData(e.to_string()))?;
    let reuse = reuse(img.width(), img.height());
    RawBuffer::from_dynamic_image(img, format, reuse)
}
