//! Storage Layer
//!
//! Resolves application directories and persists extraction reports.

pub mod report;

use anyhow::Result;
use std::path::PathBuf;

pub use report::{ExtractionReport, HighlightRepository, ReportRepository};

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "highlightharvester", "HighlightHarvester")
        .ok_or_else(|| anyhow::anyhow!("Could not determine application directories"))
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = project_dirs()?.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir)
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = project_dirs()?.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}

/// Default directory for extraction reports
pub fn default_output_dir() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("extractions"))
}
