//! Application Configuration
//!
//! Detection thresholds, recognition policy and run defaults stored in TOML
//! format. Values are read once when the pipeline is built.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::extraction::{ExtractionParams, ReadingMode, DEFAULT_SCAN_REGION};
use crate::vision::{DetectionConfig, Rect, RecognitionConfig, TesseractConfig};

/// Application settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Highlight detection thresholds
    pub detection: DetectionConfig,
    /// Recognition attempt selection
    pub recognition: RecognitionConfig,
    /// Tesseract invocation
    pub tesseract: TesseractConfig,
    /// Run defaults
    pub extraction: ExtractionSettings,
    /// Report output
    pub output: OutputConfig,
    /// Debug image dumps
    pub diagnostics: DiagnosticsConfig,
}

/// Defaults for extraction runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    /// Region reading strategy
    pub mode: ReadingMode,
    /// Rectangles read on each page; the first one is probed during the scan
    pub scan_regions: Vec<Rect>,
    /// Minimum accepted text length in characters
    pub min_text_length: usize,
    /// Minimum accepted confidence (0 - 100)
    pub min_confidence: f32,
    /// Settle delay after navigation during the scan
    pub navigation_delay_ms: u64,
    /// Settle delay after navigation before recognition
    pub ocr_delay_ms: u64,
    /// Upper bound for page source and recognition calls; unbounded when unset
    pub collaborator_timeout_ms: Option<u64>,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            mode: ReadingMode::PerHighlight,
            scan_regions: vec![DEFAULT_SCAN_REGION],
            min_text_length: 3,
            min_confidence: 30.0,
            navigation_delay_ms: 300,
            ocr_delay_ms: 1000,
            collaborator_timeout_ms: None,
        }
    }
}

impl ExtractionSettings {
    /// Run parameters for a document of `total_pages` pages
    pub fn to_params(&self, total_pages: u32) -> ExtractionParams {
        ExtractionParams {
            scan_regions: self.scan_regions.clone(),
            min_text_length: self.min_text_length,
            min_confidence: self.min_confidence,
            navigation_delay: Duration::from_millis(self.navigation_delay_ms),
            ocr_delay: Duration::from_millis(self.ocr_delay_ms),
            ..ExtractionParams::new(total_pages)
        }
    }

    pub fn collaborator_timeout(&self) -> Option<Duration> {
        self.collaborator_timeout_ms.map(Duration::from_millis)
    }
}

/// Report output settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Report directory; `<data dir>/extractions` when unset
    pub directory: Option<PathBuf>,
}

/// Diagnostic image dump settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Write intermediate images here when set
    pub image_dump_dir: Option<PathBuf>,
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {:?}", path))?;
    let config: AppConfig =
        toml::from_str(&content).with_context(|| format!("Failed to parse config {:?}", path))?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        // Detection defaults
        assert_eq!(config.detection.min_area, 250);
        assert_eq!(config.detection.min_width, 35);
        assert_eq!(config.detection.min_height, 12);
        assert_eq!(config.detection.color_ranges.len(), 3);

        // Recognition defaults
        assert!((config.recognition.confidence_floor - 30.0).abs() < 0.01);
        assert_eq!(config.recognition.upscale_area_limit, 10_000);
        assert_eq!(config.tesseract.language, "fra+eng");

        // Extraction defaults
        assert_eq!(config.extraction.mode, ReadingMode::PerHighlight);
        assert_eq!(config.extraction.scan_regions, vec![Rect::new(50, 100, 1600, 980)]);
        assert_eq!(config.extraction.navigation_delay_ms, 300);
        assert_eq!(config.extraction.ocr_delay_ms, 1000);
        assert!(config.extraction.collaborator_timeout().is_none());

        assert!(config.output.directory.is_none());
        assert!(config.diagnostics.image_dump_dir.is_none());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = AppConfig::default();

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config, parsed);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml_str = r#"
            [extraction]
            mode = "whole_region"
            collaborator_timeout_ms = 5000

            [detection]
            min_area = 400
        "#;
        let parsed: AppConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(parsed.extraction.mode, ReadingMode::WholeRegion);
        assert_eq!(parsed.extraction.collaborator_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(parsed.extraction.min_text_length, 3);
        assert_eq!(parsed.detection.min_area, 400);
        assert_eq!(parsed.detection.min_width, 35);
        assert_eq!(parsed.recognition, RecognitionConfig::default());
    }

    #[test]
    fn test_to_params() {
        let mut settings = ExtractionSettings::default();
        settings.min_confidence = 55.0;
        settings.navigation_delay_ms = 0;

        let params = settings.to_params(12);
        assert_eq!(params.total_pages, 12);
        assert_eq!(params.start_page, 1);
        assert_eq!(params.end(), 12);
        assert_eq!(params.min_confidence, 55.0);
        assert_eq!(params.navigation_delay, Duration::ZERO);
        assert_eq!(params.ocr_delay, Duration::from_secs(1));
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_config() {
        let mut config = AppConfig::default();
        config.output.directory = Some(PathBuf::from("/tmp/reports"));

        let temp_file = NamedTempFile::new().unwrap();
        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(loaded.output.directory, Some(PathBuf::from("/tmp/reports")));
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }
}
