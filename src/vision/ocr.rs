//! OCR (Optical Character Recognition) module
//!
//! [`TextExtractor`] owns the multi-attempt policy for one highlight crop; the
//! actual recognition is delegated to a [`RecognitionEngine`] backend.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::diagnostics::{DiagnosticsSink, NoopSink};
use super::ocr_preprocess::{enhance_contrast, upscale};

/// How the engine should interpret the page layout of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationMode {
    /// Treat the image as a single text line
    SingleLine,
    /// Treat the image as a uniform block of text
    Block,
}

impl SegmentationMode {
    /// Tesseract page segmentation mode number
    pub fn psm(self) -> u8 {
        match self {
            Self::SingleLine => 7,
            Self::Block => 6,
        }
    }
}

/// One recognized word
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Recognized text
    pub text: String,
    /// Recognition confidence (0 - 100, negative for non-word rows)
    pub confidence: f32,
}

impl Token {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Recognition backend
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    /// Recognize the words in an image
    async fn recognize_tokens(&self, image: &RgbImage, mode: SegmentationMode) -> Result<Vec<Token>>;

    /// Whether the backend can be used right now
    async fn is_available(&self) -> bool;
}

/// Aggregated text and confidence of one recognition
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Recognition {
    pub text: String,
    /// Mean token confidence (0 - 100)
    pub confidence: f32,
}

impl Recognition {
    /// Empty text with zero confidence
    pub fn empty() -> Self {
        Self::default()
    }

    /// Join tokens with positive confidence and non-empty text
    pub fn from_tokens(tokens: &[Token]) -> Self {
        let kept: Vec<&Token> = tokens
            .iter()
            .filter(|t| t.confidence > 0.0 && !t.text.trim().is_empty())
            .collect();

        if kept.is_empty() {
            return Self::empty();
        }

        let text = kept.iter().map(|t| t.text.trim()).collect::<Vec<_>>().join(" ");
        let confidence = kept.iter().map(|t| t.confidence).sum::<f32>() / kept.len() as f32;
        Self { text, confidence }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Number of characters in the trimmed text
    pub fn text_len(&self) -> usize {
        self.text.trim().chars().count()
    }
}

/// The independent recognition attempts made on one crop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    /// Unmodified crop, single-line interpretation
    SingleLine,
    /// Unmodified crop, block interpretation
    Block,
    /// Enlarged crop, block interpretation (small crops only)
    Upscaled,
    /// Contrast-enhanced crop, block interpretation
    Enhanced,
}

impl AttemptKind {
    fn mode(self) -> SegmentationMode {
        match self {
            Self::SingleLine => SegmentationMode::SingleLine,
            _ => SegmentationMode::Block,
        }
    }

    fn stage(self) -> &'static str {
        match self {
            Self::SingleLine | Self::Block => "ocr_original",
            Self::Upscaled => "ocr_upscaled",
            Self::Enhanced => "ocr_enhanced",
        }
    }
}

/// Attempt selection policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Attempts below this confidence are discarded
    pub confidence_floor: f32,
    /// Attempts with fewer trimmed characters are discarded
    pub min_text_chars: usize,
    /// Crops with a smaller pixel area also get an upscaled attempt
    pub upscale_area_limit: u32,
    /// Enlargement factor for the upscaled attempt
    pub upscale_factor: u32,
    /// Contrast factor for the enhanced attempt
    pub contrast_factor: f32,
    /// Score bonus per character of recognized text
    pub length_weight: f32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 30.0,
            min_text_chars: 3,
            upscale_area_limit: 10_000,
            upscale_factor: 2,
            contrast_factor: 1.5,
            length_weight: 0.1,
        }
    }
}

impl RecognitionConfig {
    fn qualifies(&self, r: &Recognition) -> bool {
        r.confidence >= self.confidence_floor && r.text_len() >= self.min_text_chars
    }

    fn score(&self, r: &Recognition) -> f32 {
        r.confidence + self.length_weight * r.text.chars().count() as f32
    }
}

/// Pick the qualifying attempt with the highest length-weighted score
///
/// Ties keep the earliest attempt.
pub fn select_best<I>(attempts: I, config: &RecognitionConfig) -> Option<(AttemptKind, Recognition)>
where
    I: IntoIterator<Item = (AttemptKind, Recognition)>,
{
    let mut best: Option<(AttemptKind, Recognition, f32)> = None;

    for (kind, recognition) in attempts {
        if !config.qualifies(&recognition) {
            continue;
        }
        let score = config.score(&recognition);
        if best.as_ref().map_or(true, |(_, _, s)| score > *s) {
            best = Some((kind, recognition, score));
        }
    }

    best.map(|(kind, recognition, _)| (kind, recognition))
}

/// Runs several recognition attempts over a highlight crop and keeps the best
pub struct TextExtractor {
    engine: Arc<dyn RecognitionEngine>,
    config: RecognitionConfig,
    sink: Arc<dyn DiagnosticsSink>,
    timeout: Option<Duration>,
}

impl TextExtractor {
    /// Create an extractor with the default selection policy
    pub fn new(engine: Arc<dyn RecognitionEngine>) -> Self {
        Self::with_config(engine, RecognitionConfig::default())
    }

    /// Create an extractor with a custom selection policy
    pub fn with_config(engine: Arc<dyn RecognitionEngine>, config: RecognitionConfig) -> Self {
        Self {
            engine,
            config,
            sink: Arc::new(NoopSink),
            timeout: None,
        }
    }

    /// Attach a diagnostics sink for attempt images
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Bound each engine call; an expired call counts as a failed attempt
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The underlying engine
    pub fn engine(&self) -> &Arc<dyn RecognitionEngine> {
        &self.engine
    }

    /// Recognize a highlight crop, returning empty text and 0 confidence when
    /// no attempt qualifies
    pub async fn recognize(&self, region: &RgbImage) -> Recognition {
        let area = region.width() as u64 * region.height() as u64;
        if area == 0 {
            return Recognition::empty();
        }

        let mut inputs: Vec<(AttemptKind, RgbImage)> = Vec::with_capacity(4);
        if area < self.config.upscale_area_limit as u64 {
            inputs.push((AttemptKind::Upscaled, upscale(region, self.config.upscale_factor)));
        }
        inputs.push((AttemptKind::Enhanced, enhance_contrast(region, self.config.contrast_factor)));

        if self.sink.is_enabled() {
            self.sink.record_image(AttemptKind::Block.stage(), &DynamicImage::ImageRgb8(region.clone()));
            for (kind, img) in &inputs {
                self.sink.record_image(kind.stage(), &DynamicImage::ImageRgb8(img.clone()));
            }
        }

        let mut attempts = vec![
            self.attempt(AttemptKind::SingleLine, region),
            self.attempt(AttemptKind::Block, region),
        ];
        for (kind, img) in &inputs {
            attempts.push(self.attempt(*kind, img));
        }

        let results = join_all(attempts).await.into_iter().flatten();

        match select_best(results, &self.config) {
            Some((kind, recognition)) => {
                debug!(
                    "Best attempt {:?}: '{}' ({:.1}%)",
                    kind, recognition.text, recognition.confidence
                );
                recognition
            }
            None => {
                debug!("No recognition attempt qualified");
                Recognition::empty()
            }
        }
    }

    /// Single recognition pass with no selection policy applied
    pub async fn recognize_once(&self, image: &RgbImage, mode: SegmentationMode) -> Result<Recognition> {
        let tokens = self.call_engine(image, mode).await?;
        Ok(Recognition::from_tokens(&tokens))
    }

    /// Run one attempt; failures are logged and discarded
    async fn attempt(&self, kind: AttemptKind, image: &RgbImage) -> Option<(AttemptKind, Recognition)> {
        match self.call_engine(image, kind.mode()).await {
            Ok(tokens) => {
                let recognition = Recognition::from_tokens(&tokens);
                debug!(
                    "  {:?}: '{}' (conf: {:.1}%)",
                    kind, recognition.text, recognition.confidence
                );
                Some((kind, recognition))
            }
            Err(e) => {
                warn!("Recognition attempt {:?} failed: {:#}", kind, e);
                None
            }
        }
    }

    async fn call_engine(&self, image: &RgbImage, mode: SegmentationMode) -> Result<Vec<Token>> {
        let call = self.engine.recognize_tokens(image, mode);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| anyhow!("recognition timed out after {:?}", limit))?,
            None => call.await,
        }
    }
}
