use std::io;

use super::{DecodeContext, DecodeRequest, DecodeResult};
use crate::encode::encode_png;
use crate::error::DecodeError;
use crate::process::resize::resize_buffer;
use crate::raster::{DataFrom, TransformTag};

/// Resize, processor and disk cache write, applied to every non-final result.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostProcess;

impl PostProcess {
    pub fn run(
        &self,
        ctx: &DecodeContext,
        request: &DecodeRequest<'_>,
        mut result: DecodeResult,
    ) -> Result<DecodeResult, DecodeError> {
        if result.is_final {
            return Ok(result);
        }

        let pool = ctx.pool_for(request.pooling);
        if let Some(resize) = &request.options.resize {
            if let Some(resized) = resize_buffer(result.buffer.buffer(), resize, pool)? {
                // The previous handle is dropped here and its buffer reclaimed.
                result.buffer = ctx.wrap(resized, request.pooling);
            }
            result.push_transform(TransformTag::Resized);
        }

        if let Some(processor) = &request.options.processor {
            let processed = match processor.process(result.buffer.buffer(), pool) {
                Ok(processed) => processed,
                Err(err) => {
                    tracing::warn!(
                        key = %request.key,
                        processor = %processor.key(),
                        error = %err,
                        "Processor failed"
                    );
                    result.release();
                    return Err(err);
                }
            };
            result.buffer = ctx.wrap(processed, request.pooling);
            result.push_transform(TransformTag::Processed(processor.key()));
        }

        if result.data_from != DataFrom::DiskCache {
            if let Some(disk) = ctx.writable_disk(request) {
                let buffer = result.buffer.buffer();
                // Failures are logged by the cache; the result is still good.
                let _ = disk.write(&request.key.transformed(), |sink| {
                    encode_png(buffer, sink).map_err(io::Error::from)
                });
            }
        }

        Ok(result)
    }
}
