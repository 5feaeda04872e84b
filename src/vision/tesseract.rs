//! Tesseract command-line backend
//!
//! Pipes a PNG-encoded crop into `tesseract stdin stdout ... tsv` and parses the
//! word rows of the TSV report into tokens.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info};

use super::ocr::{RecognitionEngine, SegmentationMode, Token};

/// Tesseract invocation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseractConfig {
    /// Executable name or path
    pub binary: PathBuf,
    /// Language string, e.g. "fra+eng"
    pub language: String,
    /// OCR engine mode (3 = default, based on what is available)
    pub oem: u8,
}

impl Default for TesseractConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
            language: "fra+eng".to_string(),
            oem: 3,
        }
    }
}

/// Recognition engine backed by the `tesseract` executable
pub struct TesseractEngine {
    config: TesseractConfig,
}

impl TesseractEngine {
    pub fn new(config: TesseractConfig) -> Self {
        Self { config }
    }

    /// Build the argument list for one recognition
    fn args(&self, mode: SegmentationMode) -> Vec<String> {
        vec![
            "stdin".to_string(),
            "stdout".to_string(),
            "--oem".to_string(),
            self.config.oem.to_string(),
            "--psm".to_string(),
            mode.psm().to_string(),
            "-l".to_string(),
            self.config.language.clone(),
            "tsv".to_string(),
        ]
    }
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self::new(TesseractConfig::default())
    }
}

#[async_trait]
impl RecognitionEngine for TesseractEngine {
    async fn recognize_tokens(&self, image: &RgbImage, mode: SegmentationMode) -> Result<Vec<Token>> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(vec![]);
        }

        let png = encode_png(image)?;
        debug!(
            "Tesseract: {}x{} image, psm {}",
            image.width(),
            image.height(),
            mode.psm()
        );

        let mut child = Command::new(&self.config.binary)
            .args(self.args(mode))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {:?}", self.config.binary))?;

        let mut stdin = child.stdin.take().context("Tesseract stdin unavailable")?;
        let writer = tokio::spawn(async move {
            stdin.write_all(&png).await?;
            stdin.shutdown().await
        });

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for tesseract")?;
        let written = writer.await.context("Tesseract input writer panicked")?;

        if !output.status.success() {
            bail!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        written.context("Failed to write image to tesseract")?;

        let tsv = String::from_utf8_lossy(&output.stdout);
        Ok(parse_tsv(&tsv))
    }

    async fn is_available(&self) -> bool {
        match Command::new(&self.config.binary).arg("--version").output().await {
            Ok(output) if output.status.success() => {
                // Older releases print the version on stderr
                let text = if output.stdout.is_empty() { &output.stderr } else { &output.stdout };
                let version = String::from_utf8_lossy(text);
                info!("Tesseract available: {}", version.lines().next().unwrap_or("unknown"));
                true
            }
            Ok(output) => {
                error!("Tesseract not available: exited with {}", output.status);
                false
            }
            Err(e) => {
                error!("Tesseract not available: {}", e);
                false
            }
        }
    }
}

/// Encode an image as PNG bytes
fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .context("Failed to encode image as PNG")?;
    Ok(buf)
}

/// Parse Tesseract TSV output into tokens
///
/// Columns: level page block par line word left top width height conf text.
/// Structural rows carry conf -1 and no text; they are kept and filtered later.
fn parse_tsv(tsv: &str) -> Vec<Token> {
    tsv.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 11 {
                return None;
            }
            let confidence = cols[10].trim().parse::<f32>().ok()?;
            let text = cols.get(11).copied().unwrap_or("").to_string();
            Some(Token { text, confidence })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
1\t1\t0\t0\t0\t0\t0\t0\t200\t40\t-1\t\n\
4\t1\t1\t1\t1\t0\t4\t6\t180\t20\t-1\t\n\
5\t1\t1\t1\t1\t1\t4\t6\t60\t20\t91.5\tBonjour\n\
5\t1\t1\t1\t1\t2\t70\t6\t80\t20\t87.25\tle monde\n";

    #[test]
    fn test_parse_tsv() {
        let tokens = parse_tsv(SAMPLE);
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[0].confidence, -1.0);
        assert_eq!(tokens[2], Token::new("Bonjour", 91.5));
        assert_eq!(tokens[3], Token::new("le monde", 87.25));
    }

    #[test]
    fn test_parse_tsv_ignores_garbage() {
        let tokens = parse_tsv("header\nnot\ta\trow\n\n");
        assert!(tokens.is_empty());
    }

    #[test]
    fn test_args() {
        let engine = TesseractEngine::default();
        let args = engine.args(SegmentationMode::SingleLine);
        assert_eq!(
            args,
            vec!["stdin", "stdout", "--oem", "3", "--psm", "7", "-l", "fra+eng", "tsv"]
        );
    }

    #[test]
    fn test_encode_png_signature() {
        let png = encode_png(&RgbImage::new(2, 2)).unwrap();
        assert_eq!(&png[..4], &[0x89, b'P', b'N', b'G']);
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let engine = TesseractEngine::new(TesseractConfig {
            binary: PathBuf::from("/nonexistent/tesseract-binary"),
            ..Default::default()
        });
        assert!(!engine.is_available().await);
    }
}
