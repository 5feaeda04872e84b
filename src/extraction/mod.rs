//! Extraction Layer
//!
//! Task state machine, event bus, region-reading strategies and the
//! two-phase orchestrator that ties the capture and vision layers together.

pub mod events;
pub mod orchestrator;
pub mod reader;
pub mod task;

pub use events::{Event, EventBus, EventHandler, EventKind, EventPayload, SubscriptionId};
pub use orchestrator::{ExtractionOrchestrator, ExtractionParams, DEFAULT_SCAN_REGION};
pub use reader::{Reading, ReadingMode, RegionReader};
pub use task::{ConfidenceLevel, ExtractedHighlight, Task, TaskStatus};
