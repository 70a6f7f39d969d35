//! The built-in decode stages.

use std::io;

use super::{
    aspect_mismatch, calculate_sample_size, DecodeContext, DecodeRequest, DecodeResult, DecodeStage,
};
use crate::codec::{DecodeParams, MIME_GIF};
use crate::encode;
use crate::error::{CacheError, DecodeError};
use crate::options::ScaleType;
use crate::process::resize::crop_region;
use crate::raster::{DataFrom, TransformTag};

/// Serves a committed transformed result from the disk cache.
///
/// The result is final: post-processing already happened before it was
/// written. Its [`ImageInfo`](crate::raster::ImageInfo) comes from the
/// original source, never from the cached bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformCacheProbe;

impl DecodeStage for TransformCacheProbe {
    fn name(&self) -> &'static str {
        "TransformCacheProbe"
    }

    fn matches(&self, ctx: &DecodeContext, request: &DecodeRequest<'_>) -> bool {
        ctx.readable_disk(request)
            .is_some_and(|disk| disk.exists(&request.key.transformed()))
    }

    fn decode(
        &self,
        ctx: &DecodeContext,
        request: &DecodeRequest<'_>,
    ) -> Result<DecodeResult, DecodeError> {
        let disk = ctx.readable_disk(request).ok_or_else(|| {
            CacheError::DiskIoFailure(io::Error::other("disk cache not readable"))
        })?;
        let key = request.key.transformed();
        let bytes = disk.open_read(&key)?.ok_or_else(|| {
            CacheError::DiskIoFailure(io::Error::new(io::ErrorKind::NotFound, "entry vanished"))
        })?;

        let format = request.pixel_format();
        let decoded = encode::decode_png(&bytes, format, |width, height| {
            ctx.acquire(width, height, format, request.pooling)
        });
        let buffer = match decoded {
            Ok(buffer) => buffer,
            Err(DecodeError::CorruptData(reason)) => {
                return Err(disk.discard_corrupt(&key, reason).into())
            }
            Err(err) => return Err(err),
        };

        let mut result = DecodeResult::new(
            ctx.wrap(buffer, request.pooling),
            request.info.clone(),
            DataFrom::DiskCache,
        );
        for tag in request.expected_transforms() {
            result.push_transform(tag);
        }
        Ok(result.finalized())
    }
}

/// Decodes only the part of the source a thumbnail keeps.
///
/// Used when the target aspect ratio differs from the source's by more than
/// the configured threshold: decoding just the kept region allows a smaller
/// sample size, so the thumbnail is sharper for the same memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThumbnailRegionDecode;

impl DecodeStage for ThumbnailRegionDecode {
    fn name(&self) -> &'static str {
        "ThumbnailRegionDecode"
    }

    fn matches(&self, ctx: &DecodeContext, request: &DecodeRequest<'_>) -> bool {
        let options = request.options;
        let Some(resize) = &options.resize else {
            return false;
        };
        if !options.thumbnail_mode || resize.scale == ScaleType::Fill {
            return false;
        }
        let mime = request.info.mime_type.as_str();
        if !ctx.codec.supports(mime) || !ctx.codec.supports_region(mime) {
            return false;
        }
        let (width, height) = request.upright_dimensions();
        aspect_mismatch(width, height, resize.width, resize.height)
            > ctx.config.thumbnail_ratio_threshold
    }

    fn decode(
        &self,
        ctx: &DecodeContext,
        request: &DecodeRequest<'_>,
    ) -> Result<DecodeResult, DecodeError> {
        let Some(resize) = request.options.resize.as_ref() else {
            return FormatDecode.decode(ctx, request);
        };
        let info = request.info;
        let orientation = request.orientation();
        let (width, height) = request.upright_dimensions();

        let upright_region = crop_region(width, height, resize);
        let raw_region = orientation.map_region_to_raw(upright_region, info.width, info.height);
        let sample = calculate_sample_size(
            upright_region.width,
            upright_region.height,
            request.options,
            &ctx.config,
        );
        tracing::debug!(
            key = %request.key,
            ?upright_region,
            ?raw_region,
            sample,
            "Decoding thumbnail region"
        );

        let params = DecodeParams::new(request.pixel_format())
            .with_sample_size(sample)
            .with_region(raw_region);
        let raw = ctx.decode_source(request, &params)?;
        let (buffer, oriented) = ctx.correct_orientation(raw, request);

        let mut result = DecodeResult::new(
            ctx.wrap(buffer, request.pooling),
            info.clone(),
            request.source.data_from,
        );
        result.push_transform(TransformTag::RegionCropped);
        if sample > 1 {
            result.push_transform(TransformTag::Sampled(sample));
        }
        if oriented {
            result.push_transform(TransformTag::OrientationCorrected);
        }
        Ok(result)
    }
}

/// Decodes the whole source, sampled down to what the options need.
///
/// Animated formats decode their first frame and are final.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatDecode;

impl DecodeStage for FormatDecode {
    fn name(&self) -> &'static str {
        "FormatDecode"
    }

    fn matches(&self, ctx: &DecodeContext, request: &DecodeRequest<'_>) -> bool {
        ctx.codec.supports(&request.info.mime_type)
    }

    fn decode(
        &self,
        ctx: &DecodeContext,
        request: &DecodeRequest<'_>,
    ) -> Result<DecodeResult, DecodeError> {
        let (width, height) = request.upright_dimensions();
        let sample = calculate_sample_size(width, height, request.options, &ctx.config);
        let params = DecodeParams::new(request.pixel_format()).with_sample_size(sample);

        let raw = ctx.decode_source(request, &params)?;
        let (buffer, oriented) = ctx.correct_orientation(raw, request);

        let mut result = DecodeResult::new(
            ctx.wrap(buffer, request.pooling),
            request.info.clone(),
            request.source.data_from,
        );
        if sample > 1 {
            result.push_transform(TransformTag::Sampled(sample));
        }
        if oriented {
            result.push_transform(TransformTag::OrientationCorrected);
        }
        if request.info.mime_type == MIME_GIF {
            result = result.finalized();
        }
        Ok(result)
    }
}
