//! Image preprocessing: smart resize, normalization and patch flattening.

use super::config::{GlmImageProcessorConfig, GlmVisionConfig};
use candle_core::{DType, Device, Result, Tensor, bail};
use image::{RgbImage, imageops::FilterType};

/// A single image turned into vision-tower inputs.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    /// Flattened patches, shape `(num_patches, patch_dim)`.
    pub pixel_values: Tensor,
    /// Patch grid as `(temporal, height, width)`.
    pub grid_thw: (usize, usize, usize),
    /// Placeholder tokens the prompt must reserve for this image.
    pub image_token_count: usize,
}

/// Picks target dimensions that are multiples of `factor` while keeping the
/// pixel volume (temporal frames included) within `[min_pixels, max_pixels]`.
pub(crate) fn fit_to_grid(
    height: u32,
    width: u32,
    factor: u32,
    temporal_factor: usize,
    min_pixels: u32,
    max_pixels: u32,
) -> Result<(u32, u32)> {
    if factor == 0 {
        bail!("resize factor must be > 0");
    }

    let mut height = height as f64;
    let mut width = width as f64;
    let factor_f = factor as f64;
    let frames = temporal_factor as f64;

    if height < factor_f {
        width = (width * factor_f / height).round();
        height = factor_f;
    }
    if width < factor_f {
        height = (height * factor_f / width).round();
        width = factor_f;
    }

    let ratio = height.max(width) / height.min(width);
    if ratio > 200.0 {
        bail!("absolute aspect ratio must be <= 200, got {ratio:.3}");
    }

    let mut h_bar = (height / factor_f).round() * factor_f;
    let mut w_bar = (width / factor_f).round() * factor_f;

    let volume = frames * h_bar * w_bar;
    if volume > max_pixels as f64 {
        let beta = ((frames * height * width) / max_pixels as f64).sqrt();
        h_bar = (((height / beta) / factor_f).floor() * factor_f).max(factor_f);
        w_bar = (((width / beta) / factor_f).floor() * factor_f).max(factor_f);
    } else if volume < min_pixels as f64 {
        let beta = (min_pixels as f64 / (frames * height * width)).sqrt();
        h_bar = ((height * beta) / factor_f).ceil() * factor_f;
        w_bar = ((width * beta) / factor_f).ceil() * factor_f;
    }

    Ok((h_bar as u32, w_bar as u32))
}

/// PIL resample codes to the closest `image` crate filter.
pub(crate) fn resample_filter(resample: Option<u32>) -> FilterType {
    match resample {
        Some(0) => FilterType::Nearest,
        Some(1) => FilterType::Lanczos3,
        Some(2) => FilterType::Triangle,
        Some(4) => FilterType::Triangle,
        // 3 is bicubic; 5 (Hamming) has no direct equivalent.
        _ => FilterType::CatmullRom,
    }
}

/// Converts to planar CHW f32, applying rescale then per-channel mean/std.
pub(crate) fn to_chw_normalized(
    image: &RgbImage,
    mean: &[f32],
    std: &[f32],
    rescale: Option<f32>,
) -> Vec<f32> {
    let plane = image.width() as usize * image.height() as usize;
    let scale = rescale.unwrap_or(1.0);
    let mut chw = vec![0.0f32; 3 * plane];
    for (i, pixel) in image.pixels().enumerate() {
        for c in 0..3 {
            chw[c * plane + i] = (pixel.0[c] as f32 * scale - mean[c]) / std[c];
        }
    }
    chw
}

/// Resizes, normalizes and flattens an image into patch vectors.
///
/// Patches are emitted in merge-block order so that consecutive rows belong
/// to the same spatial merge window; within a patch the layout is channel
/// major with the temporal copies of the still image interleaved per channel.
pub fn prepare_image(
    image: &RgbImage,
    cfg: &GlmImageProcessorConfig,
    vision_cfg: &GlmVisionConfig,
    device: &Device,
    dtype: DType,
) -> Result<PreparedImage> {
    let patch = cfg.patch_size;
    let merge = cfg.merge_size;
    let temporal = cfg.temporal_patch_size;
    let factor = (patch * merge) as u32;

    let (h, w) = (image.height(), image.width());
    let (rh, rw) = if cfg.do_resize {
        fit_to_grid(
            h,
            w,
            factor,
            temporal,
            cfg.size.shortest_edge,
            cfg.size.longest_edge,
        )?
    } else {
        (h, w)
    };
    if rh % factor != 0 || rw % factor != 0 {
        bail!("image dims {rh}x{rw} are not divisible by patch factor {factor}");
    }

    let resized;
    let source = if rh != h || rw != w {
        resized = image::imageops::resize(image, rw, rh, resample_filter(cfg.resample));
        &resized
    } else {
        image
    };

    let (mean, std): (&[f32], &[f32]) = if cfg.do_normalize {
        (&cfg.image_mean, &cfg.image_std)
    } else {
        (&[0.0; 3], &[1.0; 3])
    };
    let rescale = cfg.do_rescale.then_some(cfg.rescale_factor);
    let chw = to_chw_normalized(source, mean, std, rescale);

    let height = rh as usize;
    let width = rw as usize;
    let grid_h = height / patch;
    let grid_w = width / patch;
    // A still image contributes one temporal group; the model's temporal
    // patches are identical copies, so the source plane is read repeatedly
    // instead of materializing duplicate frames.
    let grid_t = 1usize;

    let patch_dim = vision_cfg.in_channels * temporal * patch * patch;
    let num_patches = grid_t * grid_h * grid_w;
    let mut flat = Vec::with_capacity(num_patches * patch_dim);

    let plane = height * width;
    for hb in 0..grid_h / merge {
        for wb in 0..grid_w / merge {
            for hm in 0..merge {
                for wm in 0..merge {
                    let patch_row = (hb * merge + hm) * patch;
                    let patch_col = (wb * merge + wm) * patch;
                    for c in 0..vision_cfg.in_channels {
                        for _tp in 0..temporal {
                            for ph in 0..patch {
                                let row = c * plane + (patch_row + ph) * width + patch_col;
                                flat.extend_from_slice(&chw[row..row + patch]);
                            }
                        }
                    }
                }
            }
        }
    }

    let image_token_count = num_patches / (merge * merge);
    let pixel_values = Tensor::from_vec(flat, (num_patches, patch_dim), device)?.to_dtype(dtype)?;

    Ok(PreparedImage {
        pixel_values,
        grid_thw: (grid_t, grid_h, grid_w),
        image_token_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::glm::config::{GlmImageProcessorConfig, GlmVisionConfig, ImageProcessorSize};
    use candle_nn::Activation;
    use image::Rgb;

    fn vision_cfg(patch: usize, merge: usize, temporal: usize) -> GlmVisionConfig {
        GlmVisionConfig {
            hidden_size: 32,
            depth: 1,
            num_heads: 2,
            attention_bias: false,
            in_channels: 3,
            intermediate_size: 64,
            hidden_act: Activation::Silu,
            patch_size: patch,
            out_hidden_size: 32,
            rms_norm_eps: 1e-5,
            spatial_merge_size: merge,
            temporal_patch_size: temporal,
        }
    }

    fn image_cfg(patch: usize, merge: usize, temporal: usize) -> GlmImageProcessorConfig {
        GlmImageProcessorConfig {
            size: ImageProcessorSize {
                shortest_edge: 1,
                longest_edge: 10_000_000,
            },
            do_resize: true,
            do_rescale: false,
            do_normalize: false,
            rescale_factor: 1.0 / 255.0,
            resample: Some(3),
            patch_size: patch,
            temporal_patch_size: temporal,
            merge_size: merge,
            image_mean: vec![0.5, 0.5, 0.5],
            image_std: vec![0.5, 0.5, 0.5],
        }
    }

    #[test]
    fn fit_to_grid_aligns_to_the_factor() {
        let (h, w) = fit_to_grid(100, 200, 28, 2, 12_544, 1_000_000).unwrap();
        assert_eq!(h % 28, 0);
        assert_eq!(w % 28, 0);
        assert!(2 * h * w <= 1_000_000);
    }

    #[test]
    fn fit_to_grid_upscales_below_the_minimum_area() {
        let (h, w) = fit_to_grid(10, 10, 28, 2, 12_544, 1_000_000).unwrap();
        assert!(2 * h * w >= 12_544, "volume {} too small", 2 * h * w);
        assert_eq!(h % 28, 0);
        assert_eq!(w % 28, 0);
    }

    #[test]
    fn fit_to_grid_downscales_above_the_maximum_area() {
        let (h, w) = fit_to_grid(5000, 5000, 28, 2, 12_544, 1_000_000).unwrap();
        assert!(2 * h * w <= 1_000_000, "volume {} too large", 2 * h * w);
    }

    #[test]
    fn fit_to_grid_rejects_extreme_aspect_ratios() {
        assert!(fit_to_grid(28, 20_000, 28, 2, 12_544, 9_633_792).is_err());
    }

    #[test]
    fn resample_codes_map_to_filters() {
        assert_eq!(resample_filter(Some(0)), FilterType::Nearest);
        assert_eq!(resample_filter(Some(1)), FilterType::Lanczos3);
        assert_eq!(resample_filter(Some(3)), FilterType::CatmullRom);
        assert_eq!(resample_filter(None), FilterType::CatmullRom);
    }

    #[test]
    fn chw_conversion_normalizes_per_channel() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));
        let chw = to_chw_normalized(&img, &[0.5; 3], &[0.5; 3], Some(1.0 / 255.0));
        assert_eq!(chw, vec![1.0, -1.0, -1.0, 1.0, -1.0, -1.0]);
    }

    #[test]
    fn prepare_image_reports_grid_and_token_count() {
        let img = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let prepared = prepare_image(
            &img,
            &image_cfg(2, 2, 2),
            &vision_cfg(2, 2, 2),
            &Device::Cpu,
            DType::F32,
        )
        .unwrap();
        assert_eq!(prepared.grid_thw, (1, 4, 4));
        assert_eq!(prepared.image_token_count, 4);
        // 16 patches of 3 channels x 2 temporal copies x 2x2 pixels.
        assert_eq!(prepared.pixel_values.dims(), &[16, 24]);
    }

    #[test]
    fn patches_flatten_channel_major_in_block_order() {
        let mut img = RgbImage::new(2, 2);
        img.put_pixel(0, 0, Rgb([1, 2, 3]));
        img.put_pixel(1, 0, Rgb([4, 5, 6]));
        img.put_pixel(0, 1, Rgb([7, 8, 9]));
        img.put_pixel(1, 1, Rgb([10, 11, 12]));
        let mut cfg = image_cfg(1, 1, 1);
        cfg.do_resize = false;
        let prepared =
            prepare_image(&img, &cfg, &vision_cfg(1, 1, 1), &Device::Cpu, DType::F32).unwrap();
        let rows = prepared.pixel_values.to_vec2::<f32>().unwrap();
        assert_eq!(
            rows,
            vec![
                vec![1.0, 2.0, 3.0],
                vec![4.0, 5.0, 6.0],
                vec![7.0, 8.0, 9.0],
                vec![10.0, 11.0, 12.0],
            ]
        );
        assert_eq!(prepared.grid_thw, (1, 2, 2));
    }
}
