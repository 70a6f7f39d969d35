//! Crop-and-scale geometry for a requested output size.
//!
//! A resize keeps the part of the source selected by its [`ScaleType`] that
//! has the target aspect ratio, then scales it:
//! - [`ResizeMode::ExactlySame`]: to exactly the target size
//! - [`ResizeMode::AspectRatioSame`]: to the target size, but never larger
//!   than the kept region
//!
//! [`ScaleType::Fill`] keeps the whole source and stretches it.

use image::imageops::FilterType;

use crate::error::DecodeError;
use crate::options::{Resize, ResizeMode, ScaleType};
use crate::pool::BufferPool;
use crate::raster::{RawBuffer, Region};

/// The region of a `width`x`height` image kept for `resize`.
pub fn crop_region(width: u32, height: u32, resize: &Resize) -> Region {
    if resize.scale == ScaleType::Fill || resize.width == 0 || resize.height == 0 {
        return Region::new(0, 0, width, height);
    }

    let (w, h) = (width as u64, height as u64);
    let (tw, th) = (resize.width as u64, resize.height as u64);
    let (rw, rh) = if w * th > h * tw {
        // Source is wider than the target: keep full height.
        let rw = ((h * tw + th / 2) / th).clamp(1, w);
        (rw as u32, height)
    } else {
        let rh = ((w * th + tw / 2) / tw).clamp(1, h);
        (width, rh as u32)
    };

    let (x, y) = match resize.scale {
        ScaleType::Start | ScaleType::Fill => (0, 0),
        ScaleType::Center => ((width - rw) / 2, (height - rh) / 2),
        ScaleType::End => (width - rw, height - rh),
    };
    Region::new(x, y, rw, rh)
}

/// Output dimensions for `resize` applied to a kept `region`.
pub fn output_size(region: Region, resize: &Resize) -> (u32, u32) {
    let (tw, th) = (resize.width.max(1), resize.height.max(1));
    match resize.mode {
        ResizeMode::ExactlySame => (tw, th),
        ResizeMode::AspectRatioSame => {
            if region.width >= tw && region.height >= th {
                return (tw, th);
            }
            let scale = (region.width as f64 / tw as f64).min(region.height as f64 / th as f64);
            let ow = ((tw as f64 * scale).round() as u32).clamp(1, region.width.max(1));
            let oh = ((th as f64 * scale).round() as u32).clamp(1, region.height.max(1));
            (ow, oh)
        }
    }
}

/// Crop and scale `input` for `resize`, writing into a pooled buffer when
/// `pool` is given.
///
/// Returns `Ok(None)` when the input already has the requested geometry.
pub fn resize_buffer(
    input: &RawBuffer,
    resize: &Resize,
    pool: Option<&BufferPool>,
) -> Result<Option<RawBuffer>, DecodeError> {
    let region = crop_region(input.width, input.height, resize);
    let (ow, oh) = output_size(region, resize);
    let full = region.is_full(input.width, input.height);
    if full && (ow, oh) == (input.width, input.height) {
        return Ok(None);
    }

    let mut img = input
        .to_dynamic_image()
        .ok_or_else(|| DecodeError::CorruptData("buffer does not match its dimensions".to_string()))?;
    if !full {
        img = img.crop_imm(region.x, region.y, region.width, region.height);
    }
    let img = img.resize_exact(ow, oh, FilterType::Triangle);

    tracing::trace!(
        from = ?(input.width, input.height),
        ?region,
        to = ?(ow, oh),
        "Resizing"
    );
    let reuse = pool.and_then(|pool| pool.acquire(ow, oh, input.format));
    RawBuffer::from_dynamic_image(img, input.format, reuse).map(Some)
}


// ============================================================================
// Property-Based Tests
// ============================================================================
