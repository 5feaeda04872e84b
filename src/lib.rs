//! HighlightHarvester - highlighted passage extraction from paginated documents
//!
//! Drives a page source through a document, finds highlighter-colored regions
//! on every page and recognizes the text inside each one.

pub mod capture;
pub mod config;
pub mod error;
pub mod extraction;
pub mod storage;
pub mod vision;

pub use error::{ExtractionError, ExtractionResult};
