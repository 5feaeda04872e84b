//! Image preprocessing filters for OCR attempts
//!
//! Enlarging small crops and stretching contrast both give the recognizer a
//! second chance on faint or tiny highlighted text.

use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::debug;

/// Upscale an image by an integer factor (Lanczos resampling)
/// Factor should be >= 1 (1 = no change, 2 = double size, etc.)
pub fn upscale(image: &RgbImage, factor: u32) -> RgbImage {
    if factor <= 1 {
        return image.clone();
    }

    let (width, height) = image.dimensions();
    debug!("Upscaling {}x{} region by {}x", width, height, factor);
    imageops::resize(image, width * factor, height * factor, FilterType::Lanczos3)
}

/// Stretch contrast around the image's mean luminance
/// Factor > 1.0 increases contrast, < 1.0 decreases
pub fn enhance_contrast(image: &RgbImage, factor: f32) -> RgbImage {
    let mut result = image.clone();
    if (factor - 1.0).abs() <= f32::EPSILON {
        return result;
    }

    let mean = mean_luminance(image).round();
    for pixel in result.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            let val = *channel as f32;
            *channel = ((val - mean) * factor + mean).round().clamp(0.0, 255.0) as u8;
        }
    }

    result
}

/// Mean luminance (0-255) using standard weights
pub fn mean_luminance(image: &RgbImage) -> f32 {
    let count = image.width() as u64 * image.height() as u64;
    if count == 0 {
        return 0.0;
    }

    let sum: f64 = image.pixels().map(|p| luminance(p.0) as f64).sum();
    (sum / count as f64) as f32
}

/// Standard luminance weights
fn luminance(rgb: [u8; 3]) -> f32 {
    0.299 * rgb[0] as f32 + 0.587 * rgb[1] as f32 + 0.114 * rgb[2] as f32
}
