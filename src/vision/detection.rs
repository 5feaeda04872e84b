//! Highlight region detection
//!
//! Color-range segmentation for highlighter marks. The page is converted to
//! HSV, every configured range is OR-ed into one mask, the mask is cleaned with
//! a morphological close/open pass, and each connected component becomes a
//! candidate rectangle that must pass five independent size/shape/color filters.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::morphology::{close, open};
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::diagnostics::{DiagnosticsSink, NoopSink};
use super::{Rect, Region};

/// Inclusive HSV bounds on the OpenCV 8-bit scale (H 0-179, S/V 0-255)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsvRange {
    pub low: [u8; 3],
    pub high: [u8; 3],
}

impl HsvRange {
    pub const fn new(low: [u8; 3], high: [u8; 3]) -> Self {
        Self { low, high }
    }

    /// Check whether an HSV pixel lies inside the range
    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        (0..3).all(|c| hsv[c] >= self.low[c] && hsv[c] <= self.high[c])
    }
}

/// Thresholds and tuning for highlight detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Highlighter color ranges, OR-ed together
    pub color_ranges: Vec<HsvRange>,
    /// Minimum bounding box area in pixels
    pub min_area: u32,
    /// Minimum bounding box width in pixels
    pub min_width: u32,
    /// Minimum bounding box height in pixels
    pub min_height: u32,
    /// Maximum width/height ratio
    pub max_aspect_ratio: f32,
    /// Minimum fraction of mask pixels inside the bounding box (0.0 - 1.0)
    pub min_color_ratio: f32,
    /// Pixels added left and right of an accepted box
    pub padding_x: u32,
    /// Pixels added above and below an accepted box
    pub padding_y: u32,
    /// Radius of the closing pass (3x3 kernel applied this many times)
    pub close_iterations: u8,
    /// Radius of the opening pass
    pub open_iterations: u8,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            color_ranges: vec![
                HsvRange::new([20, 40, 100], [30, 255, 255]), // Main yellow
                HsvRange::new([15, 30, 80], [35, 200, 255]),  // Wider yellow
                HsvRange::new([18, 50, 120], [28, 255, 255]), // Saturated yellow
            ],
            min_area: 250,
            min_width: 35,
            min_height: 12,
            max_aspect_ratio: 25.0,
            min_color_ratio: 0.4,
            padding_x: 8,
            padding_y: 4,
            close_iterations: 2,
            open_iterations: 1,
        }
    }
}

/// Measurements of one connected component
#[derive(Debug, Clone, Copy)]
struct Candidate {
    rect: Rect,
    area: u64,
    aspect_ratio: f32,
    color_ratio: f32,
}

/// Finds highlighted regions in page images
///
/// Stateless apart from its immutable configuration: the same image, search
/// rectangle and configuration always produce the same regions in the same order.
pub struct RegionDetector {
    config: DetectionConfig,
    sink: Arc<dyn DiagnosticsSink>,
}

impl RegionDetector {
    /// Create a detector with default thresholds
    pub fn new() -> Self {
        Self::with_config(DetectionConfig::default())
    }

    /// Create a detector with custom thresholds
    pub fn with_config(config: DetectionConfig) -> Self {
        Self {
            config,
            sink: Arc::new(NoopSink),
        }
    }

    /// Attach a diagnostics sink for intermediate masks
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Current configuration
    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Find highlight regions, ordered top to bottom
    ///
    /// With a search rectangle only that part of the image is analysed, and the
    /// returned coordinates are translated back into the full image frame. The
    /// rectangle is clipped to the image; an empty intersection yields no regions.
    pub fn find_regions(&self, image: &RgbImage, search: Option<Rect>) -> Vec<Region> {
        let start = Instant::now();
        let (img_w, img_h) = image.dimensions();
        let area = search
            .unwrap_or(Rect::new(0, 0, img_w, img_h))
            .clamp_to(img_w, img_h);

        if area.area() == 0 {
            return vec![];
        }

        let combined = color_mask(image, area, &self.config.color_ranges);
        let cleaned = self.clean_mask(&combined);

        if self.sink.is_enabled() {
            self.sink.record_image("mask_combined", &DynamicImage::ImageLuma8(combined));
            self.sink.record_image("mask_cleaned", &DynamicImage::ImageLuma8(cleaned.clone()));
        }

        let candidates = measure_components(&cleaned);
        let mut regions = Vec::new();

        for (i, candidate) in candidates.iter().enumerate() {
            let rejected = self.rejection_reasons(candidate);
            if !rejected.is_empty() {
                debug!(
                    "Component {} at {:?} rejected: {}",
                    i + 1,
                    candidate.rect.bounds(),
                    rejected.join(" ")
                );
                continue;
            }

            let padded = self.pad(candidate.rect, cleaned.width(), cleaned.height());
            let mask = imageops::crop_imm(&cleaned, padded.x, padded.y, padded.width, padded.height)
                .to_image();

            let region = Region {
                rect: Rect::new(padded.x + area.x, padded.y + area.y, padded.width, padded.height),
                component: Rect::new(
                    candidate.rect.x + area.x,
                    candidate.rect.y + area.y,
                    candidate.rect.width,
                    candidate.rect.height,
                ),
                mask,
            };
            debug!(
                "Component {} accepted at {:?}: {} highlighted pixels",
                i + 1,
                region.rect.bounds(),
                region.highlighted_pixels()
            );
            regions.push(region);
        }

        // Stable sort keeps label order for regions sharing a top edge
        regions.sort_by_key(|r| r.rect.y);

        if self.sink.is_enabled() && !regions.is_empty() {
            self.sink.record_image("detected", &DynamicImage::ImageRgb8(annotate(image, &regions)));
        }

        debug!(
            "Highlight detection complete in {:?}: {} of {} components accepted",
            start.elapsed(),
            regions.len(),
            candidates.len()
        );

        regions
    }

    /// Cheap existence check used while scanning pages
    pub fn has_regions(&self, image: &RgbImage, search: Option<Rect>) -> bool {
        !self.find_regions(image, search).is_empty()
    }

    /// Close then open the mask to bridge gaps and remove speckles
    fn clean_mask(&self, mask: &GrayImage) -> GrayImage {
        let closed = if self.config.close_iterations > 0 {
            close(mask, Norm::LInf, self.config.close_iterations)
        } else {
            mask.clone()
        };

        if self.config.open_iterations > 0 {
            open(&closed, Norm::LInf, self.config.open_iterations)
        } else {
            closed
        }
    }

    /// Empty when the candidate passes every filter
    fn rejection_reasons(&self, c: &Candidate) -> Vec<String> {
        let cfg = &self.config;
        let mut reasons = Vec::new();

        if c.area < cfg.min_area as u64 {
            reasons.push(format!("area<{}", cfg.min_area));
        }
        if c.rect.width < cfg.min_width {
            reasons.push(format!("w<{}", cfg.min_width));
        }
        if c.rect.height < cfg.min_height {
            reasons.push(format!("h<{}", cfg.min_height));
        }
        if c.aspect_ratio > cfg.max_aspect_ratio {
            reasons.push(format!("ratio>{}", cfg.max_aspect_ratio));
        }
        if c.color_ratio < cfg.min_color_ratio {
            reasons.push(format!("color<{:.2}", cfg.min_color_ratio));
        }

        reasons
    }

    /// Expand a rectangle by the configured padding, clamped to the mask bounds
    fn pad(&self, rect: Rect, width: u32, height: u32) -> Rect {
        let x = rect.x.saturating_sub(self.config.padding_x);
        let y = rect.y.saturating_sub(self.config.padding_y);
        Rect {
            x,
            y,
            width: (rect.width + 2 * self.config.padding_x).min(width - x),
            height: (rect.height + 2 * self.config.padding_y).min(height - y),
        }
    }
}

impl Default for RegionDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Crop a region and blank every pixel outside its mask to white
///
/// The mask is resized (nearest neighbour) when its dimensions differ from the
/// rectangle. Blanking neighbouring, non-highlighted text keeps it out of OCR.
pub fn masked_crop(image: &RgbImage, rect: Rect, mask: &GrayImage) -> RgbImage {
    let rect = rect.clamp_to(image.width(), image.height());
    let mut cropped = imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image();

    if cropped.width() == 0 || cropped.height() == 0 {
        return cropped;
    }

    let resized;
    let mask = if mask.dimensions() != cropped.dimensions() {
        resized = imageops::resize(mask, cropped.width(), cropped.height(), FilterType::Nearest);
        &resized
    } else {
        mask
    };

    for (x, y, pixel) in cropped.enumerate_pixels_mut() {
        if mask.get_pixel(x, y).0[0] == 0 {
            *pixel = Rgb([255, 255, 255]);
        }
    }

    cropped
}

/// Convert an RGB pixel to HSV on the OpenCV 8-bit scale
pub fn rgb_to_hsv(rgb: [u8; 3]) -> [u8; 3] {
    let r = rgb[0] as f32;
    let g = rgb[1] as f32;
    let b = rgb[2] as f32;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = max - min;

    let s = if max > 0.0 { diff / max * 255.0 } else { 0.0 };

    let mut h = if diff == 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / diff
    } else if max == g {
        120.0 + 60.0 * (b - r) / diff
    } else {
        240.0 + 60.0 * (r - g) / diff
    };
    if h < 0.0 {
        h += 360.0;
    }

    // Hue is halved to fit a byte; 360 deg wraps back to 0
    let h8 = ((h / 2.0).round() as u32 % 180) as u8;
    [h8, s.round().min(255.0) as u8, max as u8]
}

/// Binary mask (0/255) of pixels inside any of the ranges, sized to `area`
fn color_mask(image: &RgbImage, area: Rect, ranges: &[HsvRange]) -> GrayImage {
    let mut mask = GrayImage::new(area.width, area.height);

    for y in 0..area.height {
        for x in 0..area.width {
            let px = image.get_pixel(area.x + x, area.y + y).0;
            let hsv = rgb_to_hsv(px);
            if ranges.iter().any(|r| r.contains(hsv)) {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
    }

    mask
}

/// Label connected components and measure each bounding box
fn measure_components(mask: &GrayImage) -> Vec<Candidate> {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));

    // (min_x, min_y, max_x, max_y) per label; label 0 is background
    let mut boxes: Vec<Option<(u32, u32, u32, u32)>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label.0[0] as usize;
        if label == 0 {
            continue;
        }
        if boxes.len() < label {
            boxes.resize(label, None);
        }
        let entry = &mut boxes[label - 1];
        *entry = Some(match *entry {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }

    boxes
        .into_iter()
        .flatten()
        .map(|(x0, y0, x1, y1)| {
            let rect = Rect::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1);
            let set = count_set(mask, rect);
            Candidate {
                rect,
                area: rect.area(),
                aspect_ratio: rect.aspect_ratio(),
                color_ratio: set as f32 / rect.area() as f32,
            }
        })
        .collect()
}

/// Count non-zero mask pixels inside a rectangle
fn count_set(mask: &GrayImage, rect: Rect) -> u64 {
    let mut count = 0;
    for y in rect.y..rect.y + rect.height {
        for x in rect.x..rect.x + rect.width {
            if mask.get_pixel(x, y).0[0] > 0 {
                count += 1;
            }
        }
    }
    count
}

/// Draw accepted regions on a copy of the page for diagnostics
fn annotate(image: &RgbImage, regions: &[Region]) -> RgbImage {
    let mut out = image.clone();
    for region in regions {
        let r = region.rect;
        if r.width == 0 || r.height == 0 {
            continue;
        }
        imageproc::drawing::draw_hollow_rect_mut(
            &mut out,
            imageproc::rect::Rect::at(r.x as i32, r.y as i32).of_size(r.width, r.height),
            Rgb([0, 200, 0]),
        );
    }
    out
}
