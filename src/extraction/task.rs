//! Extraction task state machine and extracted highlight records

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::{ExtractionError, ExtractionResult};
use crate::vision::Rect;

/// Lifecycle of an extraction run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    Scanning,
    Extracting,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    /// States reachable from this one
    pub fn allowed_transitions(self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Created => &[Scanning, Cancelled, Failed],
            Scanning => &[Extracting, Paused, Cancelled, Failed],
            Extracting => &[Completed, Paused, Cancelled, Failed],
            Paused => &[Scanning, Extracting, Cancelled],
            Completed | Cancelled | Failed => &[],
        }
    }

    /// Completed, Cancelled and Failed are final
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Textual confidence bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

/// One highlighted passage recognized on a page. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedHighlight {
    id: Uuid,
    book_id: Uuid,
    page_number: u32,
    text: String,
    confidence: f32,
    /// Rectangle the text was read from, in page coordinates
    position: Rect,
    highlight_number: u32,
    session_id: String,
    extracted_at: DateTime<Local>,
}

impl ExtractedHighlight {
    /// Build a highlight, validating its invariants
    ///
    /// Text is trimmed and must not be empty; confidence must lie in 0..=100;
    /// page and highlight numbers start at 1. The session id defaults to the
    /// current local timestamp.
    pub fn new(
        book_id: Uuid,
        page_number: u32,
        text: &str,
        confidence: f32,
        position: Rect,
        highlight_number: u32,
        session_id: Option<String>,
    ) -> ExtractionResult<Self> {
        if !(0.0..=100.0).contains(&confidence) {
            return Err(ExtractionError::InvalidHighlight(format!(
                "confidence {} outside 0..=100",
                confidence
            )));
        }
        if page_number < 1 {
            return Err(ExtractionError::InvalidHighlight("page number must be positive".into()));
        }
        if highlight_number < 1 {
            return Err(ExtractionError::InvalidHighlight(
                "highlight number must be positive".into(),
            ));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(ExtractionError::InvalidHighlight("text cannot be empty".into()));
        }

        let now = Local::now();
        Ok(Self {
            id: Uuid::new_v4(),
            book_id,
            page_number,
            text: text.to_string(),
            confidence,
            position,
            highlight_number,
            session_id: session_id.unwrap_or_else(|| now.format("%Y%m%d_%H%M%S").to_string()),
            extracted_at: now,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn book_id(&self) -> Uuid {
        self.book_id
    }

    pub fn page_number(&self) -> u32 {
        self.page_number
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn position(&self) -> Rect {
        self.position
    }

    pub fn highlight_number(&self) -> u32 {
        self.highlight_number
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn extracted_at(&self) -> DateTime<Local> {
        self.extracted_at
    }

    /// Readable identifier: `<session>_page007_highlight02`
    pub fn unique_id(&self) -> String {
        format!(
            "{}_page{:03}_highlight{:02}",
            self.session_id, self.page_number, self.highlight_number
        )
    }

    /// First 100 characters of the text
    pub fn preview_text(&self) -> String {
        if self.text.chars().count() <= 100 {
            return self.text.clone();
        }
        let head: String = self.text.chars().take(97).collect();
        format!("{head}...")
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    pub fn character_count(&self) -> usize {
        self.text.chars().count()
    }

    pub fn confidence_level(&self) -> ConfidenceLevel {
        if self.confidence >= 90.0 {
            ConfidenceLevel::High
        } else if self.confidence >= 70.0 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }

    pub fn display_title(&self) -> String {
        format!("Page {} - Highlight #{}", self.page_number, self.highlight_number)
    }

    /// Same page and word-set overlap (Jaccard) at or above the threshold
    pub fn is_similar_to(&self, other: &ExtractedHighlight, threshold: f32) -> bool {
        if self.page_number != other.page_number {
            return false;
        }

        let words = |t: &str| -> HashSet<String> {
            t.split_whitespace().map(|w| w.to_lowercase()).collect()
        };
        let a = words(&self.text);
        let b = words(&other.text);
        if a.is_empty() || b.is_empty() {
            return false;
        }

        let common = a.intersection(&b).count() as f32;
        let total = a.union(&b).count() as f32;
        common / total >= threshold
    }

    /// Order by page, then by position on the page
    pub fn reading_order(&self, other: &ExtractedHighlight) -> Ordering {
        self.page_number
            .cmp(&other.page_number)
            .then(self.highlight_number.cmp(&other.highlight_number))
    }
}

/// The mutable record of one extraction run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub book_id: Uuid,
    status: TaskStatus,
    /// Phase-local progress percentage (0 - 100)
    progress: f32,
    pub pages_scanned: u32,
    pub pages_with_content: u32,
    highlights: Vec<ExtractedHighlight>,
    pub created_at: DateTime<Local>,
    started_at: Option<DateTime<Local>>,
    completed_at: Option<DateTime<Local>>,
    pub error: Option<String>,
}

impl Task {
    /// Create a task for a new book id
    pub fn new() -> Self {
        Self::for_book(Uuid::new_v4())
    }

    /// Create a task for an existing book
    pub fn for_book(book_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            book_id,
            status: TaskStatus::Created,
            progress: 0.0,
            pages_scanned: 0,
            pages_with_content: 0,
            highlights: Vec::new(),
            created_at: Local::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn highlights(&self) -> &[ExtractedHighlight] {
        &self.highlights
    }

    pub fn highlight_count(&self) -> usize {
        self.highlights.len()
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Local>> {
        self.completed_at
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        self.status.allowed_transitions().contains(&next)
    }

    /// Move to a new status, rejecting transitions outside the table
    pub fn transition_to(&mut self, next: TaskStatus) -> ExtractionResult<()> {
        if !self.can_transition_to(next) {
            return Err(ExtractionError::Transition {
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        if next == TaskStatus::Scanning && self.started_at.is_none() {
            self.started_at = Some(Local::now());
        } else if next.is_terminal() {
            self.completed_at = Some(Local::now());
        }
        Ok(())
    }

    /// Append a highlight regardless of status
    pub fn add_highlight(&mut self, highlight: ExtractedHighlight) {
        self.highlights.push(highlight);
    }

    /// Set progress to done/total as a clamped percentage; no-op when total is 0
    pub fn update_progress(&mut self, done: u32, total: u32) {
        if total > 0 {
            self.progress = (done as f32 / total as f32 * 100.0).clamp(0.0, 100.0);
        }
    }

    /// Seconds between start and completion
    pub fn duration(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, TaskStatus::Scanning | TaskStatus::Extracting)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}
