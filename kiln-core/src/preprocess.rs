//! Image and mask preprocessing
//!
//! Diffusion pipelines require dimensions that are multiples of 8. Source
//! images are scaled to fit within a bound while preserving aspect ratio,
//! then floored to the nearest valid size; masks are resized to match their
//! image exactly and optionally feathered.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};

const DIMENSION_STEP: u32 = 8;

fn floor_to_step(value: u32) -> u32 {
    (value / DIMENSION_STEP * DIMENSION_STEP).max(DIMENSION_STEP)
}

/// Compute the largest (width, height) preserving `(w, h)`'s aspect ratio
/// that fits within `max_dimension` on both axes.
fn fit_within(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dimension {
        return (width, height);
    }
    let scale = max_dimension as f64 / longest as f64;
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}

/// Scale an init image to fit within `max_dimension` and floor both sides to
/// a multiple of 8. The resize always runs, even when only the flooring
/// changes the size, so output dimensions are exact.
pub fn normalize_image(image: &DynamicImage, max_dimension: u32) -> RgbImage {
    let (w, h) = fit_within(image.width(), image.height(), max_dimension);
    let (w, h) = (floor_to_step(w), floor_to_step(h));
    if (w, h) == (image.width(), image.height()) {
        return image.to_rgb8();
    }
    image.resize_exact(w, h, FilterType::Lanczos3).to_rgb8()
}

/// Resize a mask to exactly `target` dimensions (floored to a multiple of 8)
/// and convert to single-channel. White selects the region to regenerate.
/// `blur_radius` feathers the mask edge so the inpainted patch blends in.
pub fn normalize_mask(
    mask: &DynamicImage,
    target: (u32, u32),
    blur: bool,
    blur_radius: f32,
) -> GrayImage {
    let (w, h) = (floor_to_step(target.0), floor_to_step(target.1));
    let resized = if (w, h) == (mask.width(), mask.height()) {
        mask.to_luma8()
    } else {
        mask.resize_exact(w, h, FilterType::Lanczos3).to_luma8()
    };
    if blur && blur_radius > 0.0 {
        image::imageops::blur(&resized, blur_radius)
    } else {
        resized
    }
}
