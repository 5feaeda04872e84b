//! Page Capture Layer
//!
//! The orchestrator's only way to advance pages and obtain page images.
//! Implementations drive a live reader window or replay saved screenshots.

pub mod directory;
pub mod frame;

use anyhow::Result;
use async_trait::async_trait;

pub use directory::DirectoryPageSource;
pub use frame::{CapturedFrame, FrameFormat};

/// Page-source collaborator
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Move to a page (1-based); returns once navigation has been issued
    async fn navigate_to(&self, page: u32) -> Result<()>;

    /// Capture the currently displayed page; decoding is left to the caller
    async fn capture_frame(&self) -> Result<CapturedFrame>;

    /// Whether the source is controlling a live target
    async fn is_target_active(&self) -> bool;
}
