//! Grayscale conversion using ITU-R BT.709 coefficients.

use super::{output_buffer, ImageProcessor};
use crate::error::DecodeError;
use crate::pool::BufferPool;
use crate::raster::{PixelFormat, RawBuffer};

/// ITU-R BT.709 coefficient for red channel in luminance calculation.
const LUMINANCE_R: f32 = 0.2126;

/// ITU-R BT.709 coefficient for green channel in luminance calculation.
const LUMINANCE_G: f32 = 0.7152;

/// ITU-R BT.709 coefficient for blue channel in luminance calculation.
const LUMINANCE_B: f32 = 0.0722;

/// Calculate luminance from u8 RGB values (0 to 255).
#[inline]
fn luminance_u8(r: u8, g: u8, b: u8) -> u8 {
    let lum = LUMINANCE_R * r as f32 + LUMINANCE_G * g as f32 + LUMINANCE_B * b as f32;
    lum.clamp(0.0, 255.0).round() as u8
}

/// Replaces colour with its perceptual luminance, keeping the pixel format
/// and any alpha channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GrayscaleProcessor;

impl ImageProcessor for GrayscaleProcessor {
    fn key(&self) -> String {
        "Grayscale".to_string()
    }

    fn process(
        &self,
        input: &RawBuffer,
        pool: Option<&BufferPool>,
    ) -> Result<RawBuffer, DecodeError> {
        let mut out = output_buffer(pool, input.width, input.height, input.format);
        let src = input.pixels();
        let dst = out.pixels_mut();
        match input.format {
            PixelFormat::L8 => dst.copy_from_slice(src),
            PixelFormat::Rgb8 | PixelFormat::Rgba8 => {
                let bpp = input.format.bytes_per_pixel();
                for (s, d) in src.chunks_exact(bpp).zip(dst.chunks_exact_mut(bpp)) {
                    let lum = luminance_u8(s[0], s[1], s[2]);
                    d[0] = lum;
                    d[1] = lum;
                    d[2] = lum;
                    if bpp == 4 {
                        d[3] = s[3];
                    }
                }
            }
        }
        Ok(out)
    }
}
