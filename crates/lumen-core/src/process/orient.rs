//! Right-angle rotation and mirroring processors.

use super::{output_buffer, ImageProcessor};
use crate::error::DecodeError;
use crate::pool::BufferPool;
use crate::raster::{Orientation, RawBuffer};

fn reorient(
    input: &RawBuffer,
    orientation: Orientation,
    pool: Option<&BufferPool>,
) -> RawBuffer {
    let (width, height) = orientation.upright_dimensions(input.width, input.height);
    let mut out = output_buffer(pool, width, height, input.format);
    orientation.apply(input, &mut out);
    out
}

/// Rotates clockwise by a multiple of 90 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotateProcessor {
    degrees: u32,
}

impl RotateProcessor {
    /// Negative angles rotate counter-clockwise.
    pub fn new(degrees: i32) -> Self {
        Self {
            degrees: degrees.rem_euclid(360) as u32,
        }
    }

    pub fn degrees(&self) -> u32 {
        self.degrees
    }
}

impl ImageProcessor for RotateProcessor {
    fn key(&self) -> String {
        format!("Rotate({})", self.degrees)
    }

    fn process(
        &self,
        input: &RawBuffer,
        pool: Option<&BufferPool>,
    ) -> Result<RawBuffer, DecodeError> {
        let orientation = match self.degrees {
            0 => Orientation::Normal,
            90 => Orientation::Rotate90CW,
            180 => Orientation::Rotate180,
            270 => Orientation::Rotate270CW,
            other => {
                return Err(DecodeError::ProcessorFailed {
                    processor: self.key(),
                    reason: format!("{other} degrees is not a multiple of 90"),
                })
            }
        };
        Ok(reorient(input, orientation, pool))
    }
}

/// Mirrors horizontally or vertically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipProcessor {
    horizontal: bool,
}

impl FlipProcessor {
    pub fn horizontal() -> Self {
        Self { horizontal: true }
    }

    pub fn vertical() -> Self {
        Self { horizontal: false }
    }
}

impl ImageProcessor for FlipProcessor {
    fn key(&self) -> String {
        if self.horizontal {
            "Flip(horizontal)".to_string()
        } else {
            "Flip(vertical)".to_string()
        }
    }

    fn process(
        &self,
        input: &RawBuffer,
        pool: Option<&BufferPool>,
    ) -> Result<RawBuffer, DecodeError> {
        let orientation = if self.horizontal {
            Orientation::FlipHorizontal
        } else {
            Orientation::FlipVertical
        };
        Ok(reorient(input, orientation, pool))
    }
}
