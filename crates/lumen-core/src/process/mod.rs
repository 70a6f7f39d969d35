//! Post-decode pixel transforms.
//!
//! - [`resize`]: crop-and-scale geometry for a requested [`Resize`](crate::options::Resize)
//! - [`ImageProcessor`]: pluggable pixel transforms identified by a stable key
//!
//! Every transform writes into a fresh buffer and leaves its input untouched,
//! so a failed transform never exposes half-written pixels. The output comes
//! from the pool only when the decode attempt allows pooling.

mod grayscale;
mod orient;
pub mod resize;

use std::fmt::Debug;

use crate::error::DecodeError;
use crate::pool::BufferPool;
use crate::raster::{PixelFormat, RawBuffer};

pub use grayscale::GrayscaleProcessor;
pub use orient::{FlipProcessor, RotateProcessor};

/// A pixel transform applied after decoding.
///
/// The key becomes part of the cache key, so two processors with equal keys
/// must produce identical pixels for identical input.
pub trait ImageProcessor: Send + Sync + Debug {
    /// Stable identifier of this processor and its parameters.
    fn key(&self) -> String;

    /// Transform `input` into a new buffer.
    ///
    /// `pool` is `None` when the attempt runs without buffer pooling; the
    /// output must then be freshly allocated.
    fn process(
        &self,
        input: &RawBuffer,
        pool: Option<&BufferPool>,
    ) -> Result<RawBuffer, DecodeError>;
}

/// Output storage for a transform: pooled if allowed and available.
pub(crate) fn output_buffer(
    pool: Option<&BufferPool>,
    width: u32,
    height: u32,
    format: PixelFormat,
) -> RawBuffer {
    pool.and_then(|pool| pool.acquire(width, height, format))
        .unwrap_or_else(|| RawBuffer::allocate(width, height, format))
}
