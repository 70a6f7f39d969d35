//! Sample-size and thumbnail-region heuristics.

use crate::config::DecodeConfig;
use crate::options::DecodeOptions;

#[inline]
fn sampled(len: u32, sample: u32) -> u32 {
    len.div_ceil(sample)
}

/// Power-of-two downsample factor for decoding a `width`x`height` area.
///
/// `width` and `height` are upright dimensions, the same space the options'
/// targets are expressed in.
///
/// 1. A resize target allows the largest factor that keeps the decode at
///    least as large as the target, so the later resize only ever shrinks
/// 2. A max size requires the smallest factor that fits inside it
/// 3. With smaller thumbnails, a factor of `smaller_thumbnail_from` is
///    raised to `smaller_thumbnail_to`
/// 4. Finally the factor grows until neither edge exceeds the texture limit
pub fn calculate_sample_size(
    width: u32,
    height: u32,
    options: &DecodeOptions,
    config: &DecodeConfig,
) -> u32 {
    let mut sample: u32 = 1;

    if let Some(resize) = &options.resize {
        let (tw, th) = (resize.width.max(1), resize.height.max(1));
        while let Some(next) = sample.checked_mul(2) {
            if width / next >= tw && height / next >= th {
                sample = next;
            } else {
                break;
            }
        }
    }

    if let Some((mw, mh)) = options.max_size {
        let (mw, mh) = (mw.max(1), mh.max(1));
        while sampled(width, sample) > mw || sampled(height, sample) > mh {
            match sample.checked_mul(2) {
                Some(next) => sample = next,
                None => break,
            }
        }
    }

    if options.smaller_thumbnails && sample == config.smaller_thumbnail_from {
        sample = config.smaller_thumbnail_to.max(1);
    }

    let edge = config.max_texture_edge.max(1);
    while sampled(width, sample) > edge || sampled(height, sample) > edge {
        match sample.checked_mul(2) {
            Some(next) => sample = next,
            None => break,
        }
    }

    sample
}

/// How far apart two aspect ratios are, as a factor >= 1.
pub fn aspect_mismatch(width: u32, height: u32, target_width: u32, target_height: u32) -> f32 {
    let source = width.max(1) as f32 / height.max(1) as f32;
    let target = target_width.max(1) as f32 / target_height.max(1) as f32;
    source.max(target) / source.min(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Resize;

    fn config() -> DecodeConfig {
        DecodeConfig::default()
    }

    #[test]
    fn test_no_targets_means_full_resolution() {
        assert_eq!(calculate_sample_size(1000, 800, &DecodeOptions::new(), &config()), 1);
    }

    #[test]
    fn test_resize_keeps_decode_above_target() {
        let options = DecodeOptions::new().resize(Resize::new(100, 100));
        // 1000/8 = 125 >= 100, 1000/16 = 62 < 100.
        assert_eq!(calculate_sample_size(1000, 1000, &options, &config()), 8);
        // The shorter edge decides.
        assert_eq!(calculate_sample_size(1000, 300, &options, &config()), 2);
    }

    #[test]
    fn test_max_size_fits_inside() {
        let options = DecodeOptions::new().max_size(300, 300);
        // ceil(1000/4) = 250 <= 300.
        assert_eq!(calculate_sample_size(1000, 1000, &options, &config()), 4);
        let options = DecodeOptions::new().max_size(2000, 2000);
        assert_eq!(calculate_sample_size(1000, 1000, &options, &config()), 1);
    }

    #[test]
    fn test_smaller_thumbnails_bump() {
        let options = DecodeOptions::new()
            .resize(Resize::new(400, 400))
            .smaller_thumbnails(true);
        // Plain factor would be 2.
        assert_eq!(calculate_sample_size(1000, 1000, &options, &config()), 4);

        // Other factors are left alone.
        let options = DecodeOptions::new()
            .resize(Resize::new(100, 100))
            .smaller_thumbnails(true);
        assert_eq!(calculate_sample_size(1000, 1000, &options, &config()), 8);
    }

    #[test]
    fn test_texture_edge_clamp() {
        let mut config = config();
        config.max_texture_edge = 1000;
        assert_eq!(calculate_sample_size(4000, 100, &DecodeOptions::new(), &config), 4);
    }

    #[test]
    fn test_aspect_mismatch() {
        assert!((aspect_mismatch(100, 100, 50, 50) - 1.0).abs() < 1e-6);
        assert!((aspect_mismatch(300, 100, 100, 100) - 3.0).abs() < 1e-6);
        assert!((aspect_mismatch(100, 100, 100, 200) - 2.0).abs() < 1e-6);
    }
}

// ============================================================================
// Property-Based Tests
// ============================================================================
