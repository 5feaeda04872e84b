//! Vision/OCR Layer
//!
//! Finds highlighter-colored regions on captured pages and turns each region
//! into recognized text. Recognition backends plug in through
//! [`RecognitionEngine`]:
//! - Tesseract command line (default)

pub mod detection;
pub mod diagnostics;
pub mod ocr;
pub mod ocr_preprocess;
pub mod tesseract;

use image::GrayImage;
use serde::{Deserialize, Serialize};

pub use detection::{masked_crop, DetectionConfig, HsvRange, RegionDetector};
pub use diagnostics::{DiagnosticsSink, DirectorySink, NoopSink};
pub use ocr::{
    select_best, AttemptKind, Recognition, RecognitionConfig, RecognitionEngine, SegmentationMode,
    TextExtractor, Token,
};
pub use tesseract::{TesseractConfig, TesseractEngine};

/// Axis-aligned rectangle in source-image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Pixel area
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Width divided by height (0 for a degenerate rectangle)
    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            0.0
        } else {
            self.width as f32 / self.height as f32
        }
    }

    /// Get bounds as (x, y, width, height)
    pub fn bounds(&self) -> (u32, u32, u32, u32) {
        (self.x, self.y, self.width, self.height)
    }

    /// Clip this rectangle to an image of the given size
    pub fn clamp_to(&self, img_width: u32, img_height: u32) -> Rect {
        let x = self.x.min(img_width);
        let y = self.y.min(img_height);
        Rect {
            x,
            y,
            width: self.width.min(img_width - x),
            height: self.height.min(img_height - y),
        }
    }
}

/// A detected highlight: its rectangle plus the mask of highlighted pixels
///
/// `rect` is the padded rectangle used for cropping; `component` is the raw
/// bounding box of the connected component that passed the filters. The mask
/// has the same dimensions as `rect`; set pixels are 255.
#[derive(Debug, Clone)]
pub struct Region {
    pub rect: Rect,
    pub component: Rect,
    pub mask: GrayImage,
}

impl Region {
    /// Number of set pixels in the mask
    pub fn highlighted_pixels(&self) -> usize {
        self.mask.pixels().filter(|p| p.0[0] > 0).count()
    }
}
