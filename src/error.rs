//! Error taxonomy for extraction runs
//!
//! Isolated per-item failures (one page during the scan, one recognition
//! attempt) are logged where they happen and never reach this type.

use thiserror::Error;

use crate::extraction::task::{Task, TaskStatus};

/// Errors surfaced to the caller of an extraction run
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Recognition engine or page source not ready; raised before any phase starts
    #[error("prerequisite not met: {0}")]
    Prerequisite(String),

    /// Run parameters are inconsistent (page range, scan regions)
    #[error("invalid extraction parameters: {0}")]
    InvalidParameters(String),

    /// A state machine transition outside the allowed table was requested
    #[error("cannot transition from {from:?} to {to:?}")]
    Transition { from: TaskStatus, to: TaskStatus },

    /// An extracted highlight violates one of its invariants
    #[error("invalid highlight: {0}")]
    InvalidHighlight(String),

    /// Uncaught failure during a phase. The task has been marked FAILED.
    #[error("extraction failed: {message}")]
    Orchestration {
        message: String,
        task: Box<Task>,
    },
}

impl ExtractionError {
    /// The failed task, when the error happened after the run started
    pub fn task(&self) -> Option<&Task> {
        match self {
            Self::Orchestration { task, .. } => Some(task),
            _ => None,
        }
    }
}

/// Result alias for extraction operations
pub type ExtractionResult<T> = std::result::Result<T, ExtractionError>;
