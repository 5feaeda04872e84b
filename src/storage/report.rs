//! Extraction report persistence
//!
//! Writes one JSON report (metadata, statistics, highlights, per-page grouping)
//! and one plain-text report per run into the output directory.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::extraction::{ConfidenceLevel, ExtractedHighlight, Task};
use crate::vision::Rect;

const REPORT_VERSION: &str = "3.0";

/// Persistence collaborator for finished runs
#[async_trait]
pub trait HighlightRepository: Send + Sync {
    /// Persist a task's highlights, returning the files written
    async fn save(&self, task: &Task) -> Result<Vec<PathBuf>>;
}

/// Report header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub task_id: Uuid,
    pub book_id: Uuid,
    pub extraction_date: DateTime<Local>,
    pub session_id: Option<String>,
    pub status: String,
    pub pages_scanned: u32,
    pub pages_with_content: u32,
    pub total_highlights: usize,
    pub duration_secs: Option<f64>,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceDistribution {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceStats {
    pub average: f32,
    pub min: f32,
    pub max: f32,
    pub distribution: ConfidenceDistribution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextStats {
    pub total_words: usize,
    pub average_words_per_highlight: f32,
    pub min_words: usize,
    pub max_words: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageStats {
    pub total_pages: usize,
    pub highlights_per_page: f32,
}

/// Aggregates over all highlights of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportStatistics {
    pub confidence: ConfidenceStats,
    pub text: TextStats,
    pub pages: PageStats,
}

/// One highlight as written to the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighlightRecord {
    pub id: Uuid,
    pub unique_id: String,
    pub page_number: u32,
    pub highlight_number: u32,
    pub text: String,
    pub confidence: f32,
    pub confidence_level: ConfidenceLevel,
    pub position: Rect,
    pub session_id: String,
    pub extracted_at: DateTime<Local>,
    pub word_count: usize,
    pub character_count: usize,
    pub preview: String,
}

impl From<&ExtractedHighlight> for HighlightRecord {
    fn from(h: &ExtractedHighlight) -> Self {
        Self {
            id: h.id(),
            unique_id: h.unique_id(),
            page_number: h.page_number(),
            highlight_number: h.highlight_number(),
            text: h.text().to_string(),
            confidence: round1(h.confidence()),
            confidence_level: h.confidence_level(),
            position: h.position(),
            session_id: h.session_id().to_string(),
            extracted_at: h.extracted_at(),
            word_count: h.word_count(),
            character_count: h.character_count(),
            preview: h.preview_text(),
        }
    }
}

/// Highlights of one page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSummary {
    pub page_number: u32,
    pub highlight_count: usize,
    pub highlight_numbers: Vec<u32>,
}

/// Complete JSON report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub metadata: ReportMetadata,
    pub statistics: Option<ReportStatistics>,
    pub highlights: Vec<HighlightRecord>,
    pub pages: BTreeMap<u32, PageSummary>,
}

impl ExtractionReport {
    /// Build the report for a task
    pub fn from_task(task: &Task) -> Self {
        let sorted = sorted_highlights(task);

        let mut pages: BTreeMap<u32, PageSummary> = BTreeMap::new();
        for h in &sorted {
            let page = pages.entry(h.page_number()).or_insert_with(|| PageSummary {
                page_number: h.page_number(),
                highlight_count: 0,
                highlight_numbers: Vec::new(),
            });
            page.highlight_count += 1;
            page.highlight_numbers.push(h.highlight_number());
        }

        Self {
            metadata: ReportMetadata {
                task_id: task.id,
                book_id: task.book_id,
                extraction_date: Local::now(),
                session_id: sorted.first().map(|h| h.session_id().to_string()),
                status: format!("{:?}", task.status()),
                pages_scanned: task.pages_scanned,
                pages_with_content: task.pages_with_content,
                total_highlights: sorted.len(),
                duration_secs: task.duration(),
                version: REPORT_VERSION.to_string(),
            },
            statistics: statistics(&sorted),
            highlights: sorted.iter().map(|h| HighlightRecord::from(*h)).collect(),
            pages,
        }
    }
}

/// Writes `extraction_<timestamp>.json` and `.txt` reports
pub struct ReportRepository {
    output_dir: PathBuf,
}

impl ReportRepository {
    /// Create the repository, creating the output directory if needed
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create output directory {:?}", output_dir))?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Load a previously written JSON report by file name
    pub async fn load(&self, file_name: &str) -> Result<ExtractionReport> {
        let path = self.output_dir.join(file_name);
        if !path.exists() {
            bail!("Report not found: {:?}", path);
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read report {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse report {:?}", path))
    }

    /// JSON report file names, newest first
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = std::fs::read_dir(&self.output_dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.starts_with("extraction_") && n.ends_with(".json"))
            .collect();
        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names)
    }

    /// First unused `extraction_<timestamp>[_n]` base name
    fn base_name(&self) -> String {
        let stamp = format!("extraction_{}", Local::now().format("%Y%m%d_%H%M%S"));
        let taken = |name: &str| self.output_dir.join(format!("{name}.json")).exists();
        if !taken(&stamp) {
            return stamp;
        }
        (2..)
            .map(|n| format!("{stamp}_{n}"))
            .find(|name| !taken(name))
            .unwrap_or(stamp)
    }
}

#[async_trait]
impl HighlightRepository for ReportRepository {
    async fn save(&self, task: &Task) -> Result<Vec<PathBuf>> {
        if task.highlight_count() == 0 {
            debug!("Task {} has no highlights, nothing to save", task.id);
            return Ok(vec![]);
        }

        let base = self.base_name();
        let json_path = self.output_dir.join(format!("{base}.json"));
        let txt_path = self.output_dir.join(format!("{base}.txt"));

        let report = ExtractionReport::from_task(task);
        let json = serde_json::to_string_pretty(&report)?;
        tokio::fs::write(&json_path, json)
            .await
            .with_context(|| format!("Failed to write {:?}", json_path))?;

        tokio::fs::write(&txt_path, render_text(task))
            .await
            .with_context(|| format!("Failed to write {:?}", txt_path))?;

        info!(
            "Saved {} highlights to {:?} and {:?}",
            task.highlight_count(),
            json_path,
            txt_path
        );
        Ok(vec![json_path, txt_path])
    }
}

fn sorted_highlights(task: &Task) -> Vec<&ExtractedHighlight> {
    let mut sorted: Vec<&ExtractedHighlight> = task.highlights().iter().collect();
    sorted.sort_by(|a, b| a.reading_order(b));
    sorted
}

fn round1(v: f32) -> f32 {
    (v * 10.0).round() / 10.0
}

fn statistics(highlights: &[&ExtractedHighlight]) -> Option<ReportStatistics> {
    if highlights.is_empty() {
        return None;
    }
    let n = highlights.len();

    let confidences: Vec<f32> = highlights.iter().map(|h| h.confidence()).collect();
    let words: Vec<usize> = highlights.iter().map(|h| h.word_count()).collect();
    let level_count =
        |level: ConfidenceLevel| highlights.iter().filter(|h| h.confidence_level() == level).count();
    let pages: BTreeSet<u32> = highlights.iter().map(|h| h.page_number()).collect();

    Some(ReportStatistics {
        confidence: ConfidenceStats {
            average: round1(confidences.iter().sum::<f32>() / n as f32),
            min: confidences.iter().copied().fold(f32::INFINITY, f32::min),
            max: confidences.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            distribution: ConfidenceDistribution {
                high: level_count(ConfidenceLevel::High),
                medium: level_count(ConfidenceLevel::Medium),
                low: level_count(ConfidenceLevel::Low),
            },
        },
        text: TextStats {
            total_words: words.iter().sum(),
            average_words_per_highlight: round1(words.iter().sum::<usize>() as f32 / n as f32),
            min_words: words.iter().copied().min().unwrap_or(0),
            max_words: words.iter().copied().max().unwrap_or(0),
        },
        pages: PageStats {
            total_pages: pages.len(),
            highlights_per_page: round1(n as f32 / pages.len() as f32),
        },
    })
}

/// Human-readable report: one sheet per highlight, grouped by page
fn render_text(task: &Task) -> String {
    let rule = "=".repeat(80);
    let mut out = String::new();

    let _ = writeln!(out, "HIGHLIGHT EXTRACTION - {}", Local::now().format("%d/%m/%Y %H:%M:%S"));
    let _ = writeln!(out, "{rule}\n");
    let _ = writeln!(out, "Pages scanned: {}", task.pages_scanned);
    let _ = writeln!(out, "Pages with content: {}", task.pages_with_content);
    let _ = writeln!(out, "Highlights extracted: {}", task.highlight_count());
    let _ = writeln!(out, "{rule}\n");

    let mut current_page = None;
    for h in sorted_highlights(task) {
        if current_page != Some(h.page_number()) {
            if current_page.is_some() {
                out.push('\n');
            }
            let _ = writeln!(out, "--- PAGE {} ---\n", h.page_number());
            current_page = Some(h.page_number());
        }

        let _ = writeln!(out, "=== HIGHLIGHT #{} ===", h.highlight_number());
        let _ = writeln!(out, "{}", h.text());
        let _ = writeln!(out, "(Confidence: {:.0}%)", h.confidence());
        let _ = writeln!(out, "(Words: {})", h.word_count());
        let p = h.position();
        let _ = writeln!(out, "(Position: x={}, y={}, size={}x{})", p.x, p.y, p.width, p.height);
        let _ = writeln!(out, "(ID: {})", h.unique_id());
        let _ = writeln!(out, "\n{}\n", "-".repeat(40));
    }

    out
}
