//! Region reading strategies
//!
//! A reader turns one scan rectangle of a page image into recognized
//! passages. The strategy is chosen once when the orchestrator is built.

use async_trait::async_trait;
use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::vision::{masked_crop, Rect, RegionDetector, SegmentationMode, TextExtractor};

/// Configured reading strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingMode {
    /// Detect each highlight and recognize it separately
    #[default]
    PerHighlight,
    /// Recognize the whole scan rectangle as one block
    WholeRegion,
}

impl std::str::FromStr for ReadingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per_highlight" | "per-highlight" => Ok(Self::PerHighlight),
            "whole_region" | "whole-region" => Ok(Self::WholeRegion),
            other => Err(format!("unknown reading mode '{}'", other)),
        }
    }
}

/// One recognized passage and where it was found
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub text: String,
    pub confidence: f32,
    pub position: Rect,
}

/// Reads the passages inside one scan rectangle, top to bottom
#[async_trait]
pub trait RegionReader: Send + Sync {
    async fn read(&self, page: &RgbImage, scan: Rect) -> Vec<Reading>;
}

/// Build the reader for a mode
pub fn reader_for(
    mode: ReadingMode,
    detector: Arc<RegionDetector>,
    extractor: Arc<TextExtractor>,
) -> Arc<dyn RegionReader> {
    match mode {
        ReadingMode::PerHighlight => Arc::new(PerHighlightReader::new(detector, extractor)),
        ReadingMode::WholeRegion => Arc::new(WholeRegionReader::new(extractor)),
    }
}

/// Detector + masked crop + multi-attempt recognition for every highlight
pub struct PerHighlightReader {
    detector: Arc<RegionDetector>,
    extractor: Arc<TextExtractor>,
}

impl PerHighlightReader {
    pub fn new(detector: Arc<RegionDetector>, extractor: Arc<TextExtractor>) -> Self {
        Self { detector, extractor }
    }
}

#[async_trait]
impl RegionReader for PerHighlightReader {
    async fn read(&self, page: &RgbImage, scan: Rect) -> Vec<Reading> {
        let regions = self.detector.find_regions(page, Some(scan));
        debug!("{} highlight regions in {:?}", regions.len(), scan.bounds());

        let mut readings = Vec::with_capacity(regions.len());
        for region in &regions {
            let crop = masked_crop(page, region.rect, &region.mask);
            let recognition = self.extractor.recognize(&crop).await;
            readings.push(Reading {
                text: recognition.text,
                confidence: recognition.confidence,
                position: region.rect,
            });
        }
        readings
    }
}

/// Single block recognition over the whole scan rectangle
pub struct WholeRegionReader {
    extractor: Arc<TextExtractor>,
}

impl WholeRegionReader {
    pub fn new(extractor: Arc<TextExtractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl RegionReader for WholeRegionReader {
    async fn read(&self, page: &RgbImage, scan: Rect) -> Vec<Reading> {
        let area = scan.clamp_to(page.width(), page.height());
        if area.area() == 0 {
            return vec![];
        }

        let crop = imageops::crop_imm(page, area.x, area.y, area.width, area.height).to_image();
        match self.extractor.recognize_once(&crop, SegmentationMode::Block).await {
            Ok(recognition) => vec![Reading {
                text: recognition.text,
                confidence: recognition.confidence,
                position: area,
            }],
            Err(e) => {
                warn!("Recognition of {:?} failed: {:#}", area.bounds(), e);
                vec![]
            }
        }
    }
}
