//! Diagnostic image dumps
//!
//! Detection and recognition report intermediate images to an injected sink.
//! The default sink discards them; [`DirectorySink`] writes PNG files.

use image::DynamicImage;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Receives intermediate images from the vision pipeline
pub trait DiagnosticsSink: Send + Sync {
    /// Record an image for the named pipeline stage
    fn record_image(&self, stage: &str, image: &DynamicImage);

    /// Whether images are actually kept (lets callers skip building them)
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl DiagnosticsSink for NoopSink {
    fn record_image(&self, _stage: &str, _image: &DynamicImage) {}

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Sink that writes numbered PNG files into a directory
pub struct DirectorySink {
    dir: PathBuf,
    counter: Mutex<u64>,
}

impl DirectorySink {
    /// Create the sink, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            counter: Mutex::new(0),
        })
    }

    /// Output directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl DiagnosticsSink for DirectorySink {
    fn record_image(&self, stage: &str, image: &DynamicImage) {
        let seq = {
            let mut counter = self.counter.lock();
            *counter += 1;
            *counter
        };
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = self.dir.join(format!("{timestamp}_{seq:05}_{stage}.png"));

        match image.save(&path) {
            Ok(()) => debug!("Diagnostic image saved to {:?}", path),
            Err(e) => warn!("Failed to save diagnostic image {:?}: {}", path, e),
        }
    }
}
