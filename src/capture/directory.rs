//! Replay page source
//!
//! Serves previously captured page screenshots from a directory. Files are
//! ordered by name; page N is the N-th image file.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{CapturedFrame, PageSource};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp"];

/// Page source reading one image file per page
pub struct DirectoryPageSource {
    dir: PathBuf,
    current_page: Mutex<Option<u32>>,
}

impl DirectoryPageSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            current_page: Mutex::new(None),
        }
    }

    /// Directory being replayed
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Page currently displayed, if any navigation happened
    pub fn current_page(&self) -> Option<u32> {
        *self.current_page.lock()
    }

    /// Image files in page order
    pub fn page_files(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read page directory {:?}", self.dir))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Number of pages available
    pub fn page_count(&self) -> Result<u32> {
        Ok(self.page_files()?.len() as u32)
    }
}

#[async_trait]
impl PageSource for DirectoryPageSource {
    async fn navigate_to(&self, page: u32) -> Result<()> {
        let count = self.page_count()?;
        if page == 0 || page > count {
            bail!("Page {} out of range (1..={})", page, count);
        }

        let previous = self.current_page.lock().replace(page);
        debug!("Navigating from page {:?} to {}", previous, page);
        Ok(())
    }

    async fn capture_frame(&self) -> Result<CapturedFrame> {
        let page = self.current_page().context("No page selected before capture")?;
        let files = self.page_files()?;
        let path = files
            .get(page as usize - 1)
            .with_context(|| format!("Page {} file disappeared", page))?
            .clone();

        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read page image {:?}", path))?;

        debug!("Captured page {} from {:?}: {} bytes", page, path, bytes.len());
        Ok(CapturedFrame::encoded(bytes))
    }

    async fn is_target_active(&self) -> bool {
        match self.page_count() {
            Ok(0) => {
                warn!("Page directory {:?} contains no images", self.dir);
                false
            }
            Ok(count) => {
                info!("Page directory {:?}: {} pages", self.dir, count);
                true
            }
            Err(e) => {
                warn!("Page source not active: {:#}", e);
                false
            }
        }
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
