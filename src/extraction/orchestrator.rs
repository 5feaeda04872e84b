//! Two-phase extraction orchestrator
//!
//! Phase 1 walks the page range and flags pages that contain highlight-like
//! content. Phase 2 revisits only the flagged pages and recognizes every
//! highlight on them. Cancellation is polled at the top of each page.

use anyhow::{anyhow, Context};
use image::RgbImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{Event, EventBus, EventPayload};
use super::reader::{reader_for, ReadingMode, RegionReader};
use super::task::{ExtractedHighlight, Task, TaskStatus};
use crate::capture::{CapturedFrame, PageSource};
use crate::error::{ExtractionError, ExtractionResult};
use crate::storage::HighlightRepository;
use crate::vision::{Rect, RegionDetector, TextExtractor};

/// Scan rectangle used when none is configured
pub const DEFAULT_SCAN_REGION: Rect = Rect::new(50, 100, 1600, 980);

/// Options of one extraction run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionParams {
    /// Number of pages in the document
    pub total_pages: u32,
    /// First page to process (1-based)
    pub start_page: u32,
    /// Last page to process; defaults to `total_pages`
    pub end_page: Option<u32>,
    /// Rectangles to read on each page. The first one is the scan probe.
    pub scan_regions: Vec<Rect>,
    /// Shorter recognized texts are dropped
    pub min_text_length: usize,
    /// Less confident recognitions are dropped
    pub min_confidence: f32,
    /// Settle time after navigating during the scan
    pub navigation_delay: Duration,
    /// Settle time after navigating before recognition
    pub ocr_delay: Duration,
    /// Book the highlights belong to; a fresh id when unset
    pub book_id: Option<Uuid>,
}

impl ExtractionParams {
    /// Default options for a document of `total_pages` pages
    pub fn new(total_pages: u32) -> Self {
        Self {
            total_pages,
            start_page: 1,
            end_page: None,
            scan_regions: vec![DEFAULT_SCAN_REGION],
            min_text_length: 3,
            min_confidence: 30.0,
            navigation_delay: Duration::from_millis(300),
            ocr_delay: Duration::from_millis(1000),
            book_id: None,
        }
    }

    /// Effective last page
    pub fn end(&self) -> u32 {
        self.end_page.unwrap_or(self.total_pages)
    }

    /// Rectangle checked for content during the scan
    pub fn probe_region(&self) -> Rect {
        self.scan_regions.first().copied().unwrap_or(DEFAULT_SCAN_REGION)
    }

    pub fn validate(&self) -> ExtractionResult<()> {
        let invalid = |msg: String| Err(ExtractionError::InvalidParameters(msg));

        if self.total_pages == 0 {
            return invalid("total_pages must be at least 1".into());
        }
        if self.start_page == 0 {
            return invalid("start_page must be at least 1".into());
        }
        let end = self.end();
        if end > self.total_pages {
            return invalid(format!("end_page {} exceeds total_pages {}", end, self.total_pages));
        }
        if self.start_page > end {
            return invalid(format!("start_page {} is after end_page {}", self.start_page, end));
        }
        if self.scan_regions.is_empty() {
            return invalid("at least one scan region is required".into());
        }
        if let Some(r) = self.scan_regions.iter().find(|r| r.area() == 0) {
            return invalid(format!("scan region {:?} is empty", r.bounds()));
        }
        Ok(())
    }
}

/// How phase execution ended when no error occurred
enum Outcome {
    Completed,
    Cancelled,
}

/// Drives extraction runs over a page source
pub struct ExtractionOrchestrator {
    source: Arc<dyn PageSource>,
    detector: Arc<RegionDetector>,
    extractor: Arc<TextExtractor>,
    reader: Arc<dyn RegionReader>,
    events: Arc<EventBus>,
    repository: Option<Arc<dyn HighlightRepository>>,
    cancel: Mutex<CancellationToken>,
    timeout: Option<Duration>,
}

impl ExtractionOrchestrator {
    /// Create an orchestrator; the reading strategy is fixed from here on
    pub fn new(
        source: Arc<dyn PageSource>,
        detector: Arc<RegionDetector>,
        extractor: Arc<TextExtractor>,
        mode: ReadingMode,
    ) -> Self {
        let reader = reader_for(mode, detector.clone(), extractor.clone());
        Self {
            source,
            detector,
            extractor,
            reader,
            events: Arc::new(EventBus::new()),
            repository: None,
            cancel: Mutex::new(CancellationToken::new()),
            timeout: None,
        }
    }

    /// Publish on a shared event bus
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Persist finished runs that produced highlights
    pub fn with_repository(mut self, repository: Arc<dyn HighlightRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation_token(self, token: CancellationToken) -> Self {
        *self.cancel.lock() = token;
        self
    }

    /// Bound every navigation and capture; unbounded when `None`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Token observed by runs
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Request cooperative cancellation of the current run
    pub fn cancel(&self) {
        info!("Extraction cancellation requested");
        self.cancel.lock().cancel();
    }

    /// Install a fresh token so a cancelled orchestrator can run again
    pub fn reset_cancellation(&self) {
        *self.cancel.lock() = CancellationToken::new();
    }

    /// Run both phases over the configured page range
    ///
    /// Parameter and prerequisite failures are returned before a task exists.
    /// A failure during a phase marks the task FAILED, publishes TaskFailed and
    /// returns [`ExtractionError::Orchestration`] carrying the task.
    pub async fn run(&self, params: ExtractionParams) -> ExtractionResult<Task> {
        params.validate()?;
        self.check_prerequisites().await?;

        let token = self.cancellation_token();
        let mut task = Task::for_book(params.book_id.unwrap_or_else(Uuid::new_v4));
        info!(
            "Starting extraction task {} for pages {}-{}",
            task.id,
            params.start_page,
            params.end()
        );

        match self.execute(&mut task, &params, &token).await {
            Ok(outcome) => {
                match outcome {
                    Outcome::Completed => info!(
                        "Extraction complete: {} highlights from {} pages",
                        task.highlight_count(),
                        task.pages_with_content
                    ),
                    Outcome::Cancelled => info!(
                        "Extraction cancelled after {} pages, {} highlights kept",
                        task.pages_scanned,
                        task.highlight_count()
                    ),
                }
                self.persist(&task).await;
                Ok(task)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!("Extraction task {} failed: {}", task.id, message);

                task.error = Some(message.clone());
                if let Err(t) = task.transition_to(TaskStatus::Failed) {
                    warn!("Could not mark task failed: {}", t);
                }
                self.publish(EventPayload::TaskFailed {
                    task: task.clone(),
                    error: message.clone(),
                })
                .await;
                self.persist(&task).await;

                Err(ExtractionError::Orchestration {
                    message,
                    task: Box::new(task),
                })
            }
        }
    }

    async fn check_prerequisites(&self) -> ExtractionResult<()> {
        if !self.extractor.engine().is_available().await {
            return Err(ExtractionError::Prerequisite(
                "recognition engine is not available".into(),
            ));
        }
        if !self.source.is_target_active().await {
            return Err(ExtractionError::Prerequisite(
                "page source is not controlling a live target".into(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        task: &mut Task,
        params: &ExtractionParams,
        token: &CancellationToken,
    ) -> anyhow::Result<Outcome> {
        task.transition_to(TaskStatus::Scanning)?;
        self.publish(EventPayload::TaskStarted { task: task.clone() }).await;

        let flagged = self.scan_pages(task, params, token).await?;
        info!(
            "Scan finished: {} of {} pages have highlights",
            flagged.len(),
            task.pages_scanned
        );

        if !token.is_cancelled() {
            task.transition_to(TaskStatus::Extracting)?;
            if !flagged.is_empty() {
                self.extract_pages(task, params, &flagged, token).await?;
            }
        }

        if token.is_cancelled() {
            task.transition_to(TaskStatus::Cancelled)?;
            self.publish(EventPayload::TaskCancelled { task: task.clone() }).await;
            return Ok(Outcome::Cancelled);
        }

        task.transition_to(TaskStatus::Completed)?;
        self.publish(EventPayload::TaskCompleted { task: task.clone() }).await;
        Ok(Outcome::Completed)
    }

    /// Phase 1: flag pages with highlight-like content in the probe rectangle
    async fn scan_pages(
        &self,
        task: &mut Task,
        params: &ExtractionParams,
        token: &CancellationToken,
    ) -> anyhow::Result<Vec<u32>> {
        let probe = params.probe_region();
        let end = params.end();
        let mut flagged = Vec::new();

        for page in params.start_page..=end {
            if token.is_cancelled() {
                info!("Scan cancelled before page {}", page);
                break;
            }

            let frame = self.open_page(page, params.navigation_delay).await?;
            match decode(frame).await {
                Ok(image) => {
                    if self.detector.has_regions(&image, Some(probe)) {
                        debug!("Page {}: highlight content found", page);
                        flagged.push(page);
                        task.pages_with_content += 1;
                    }
                }
                Err(e) => warn!("Detection failed on page {}, treating as empty: {:#}", page, e),
            }

            task.pages_scanned += 1;
            task.update_progress(task.pages_scanned, params.total_pages);
            self.publish(EventPayload::TaskProgress {
                task_id: task.id,
                progress: task.progress() * 0.5,
                message: format!("Scanning page {}/{}", page, end),
            })
            .await;
        }

        Ok(flagged)
    }

    /// Phase 2: recognize every highlight on the flagged pages
    async fn extract_pages(
        &self,
        task: &mut Task,
        params: &ExtractionParams,
        flagged: &[u32],
        token: &CancellationToken,
    ) -> anyhow::Result<()> {
        let session_id = task.created_at.format("%Y%m%d_%H%M%S").to_string();
        let count = flagged.len() as u32;

        for (idx, &page) in flagged.iter().enumerate() {
            if token.is_cancelled() {
                info!("Extraction cancelled before page {}", page);
                break;
            }

            let frame = self.open_page(page, params.ocr_delay).await?;
            let image = decode(frame)
                .await
                .with_context(|| format!("Unusable frame for page {}", page))?;

            let found = self.extract_page(task, params, page, &image, &session_id).await?;
            info!("Page {}: {} highlights extracted", page, found);

            let done = idx as u32 + 1;
            task.update_progress(done, count);
            self.publish(EventPayload::TaskProgress {
                task_id: task.id,
                progress: 50.0 + done as f32 / count as f32 * 50.0,
                message: format!("Extracted page {} ({}/{})", page, done, count),
            })
            .await;
        }

        Ok(())
    }

    /// Read all scan rectangles of one page; returns the number of highlights kept
    async fn extract_page(
        &self,
        task: &mut Task,
        params: &ExtractionParams,
        page: u32,
        image: &RgbImage,
        session_id: &str,
    ) -> anyhow::Result<u32> {
        let mut number = 0;

        for &scan in &params.scan_regions {
            for reading in self.reader.read(image, scan).await {
                let text = reading.text.trim();
                if text.is_empty()
                    || text.chars().count() < params.min_text_length
                    || reading.confidence < params.min_confidence
                {
                    debug!(
                        "Page {}: dropped '{}' ({:.1}%)",
                        page, text, reading.confidence
                    );
                    continue;
                }

                number += 1;
                let highlight = ExtractedHighlight::new(
                    task.book_id,
                    page,
                    text,
                    reading.confidence,
                    reading.position,
                    number,
                    Some(session_id.to_string()),
                )?;
                debug!("{}: '{}'", highlight.display_title(), highlight.preview_text());

                task.add_highlight(highlight.clone());
                self.publish(EventPayload::HighlightFound {
                    task_id: task.id,
                    highlight,
                })
                .await;
            }
        }

        Ok(number)
    }

    /// Navigate, wait for the page to settle and capture it
    async fn open_page(&self, page: u32, settle: Duration) -> anyhow::Result<CapturedFrame> {
        self.bounded("navigation", self.source.navigate_to(page))
            .await
            .with_context(|| format!("Failed to navigate to page {}", page))?;
        tokio::time::sleep(settle).await;
        self.bounded("capture", self.source.capture_frame())
            .await
            .with_context(|| format!("Failed to capture page {}", page))
    }

    async fn bounded<T, F>(&self, what: &str, call: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| anyhow!("{} timed out after {:?}", what, limit))?,
            None => call.await,
        }
    }

    async fn publish(&self, payload: EventPayload) {
        self.events.publish(Event::new(payload)).await;
    }

    async fn persist(&self, task: &Task) {
        let Some(repository) = &self.repository else {
            return;
        };
        if task.highlight_count() == 0 {
            return;
        }
        if let Err(e) = repository.save(task).await {
            warn!("Failed to save extraction results: {:#}", e);
        }
    }
}

/// Decode a captured frame off the async runtime
async fn decode(frame: CapturedFrame) -> anyhow::Result<RgbImage> {
    tokio::task::spawn_blocking(move || frame.to_rgb())
        .await
        .context("Frame decoder panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::DirectoryPageSource;
    use crate::extraction::events::{EventHandler, EventKind};
    use crate::vision::{RecognitionEngine, SegmentationMode, Token};
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use image::{DynamicImage, Rgb};
    use imageproc::drawing::draw_filled_rect_mut;
    use std::path::PathBuf;

    const YELLOW: Rgb<u8> = Rgb([250, 230, 110]);

    fn blank() -> RgbImage {
        RgbImage::from_pixel(400, 300, Rgb([255, 255, 255]))
    }

    fn highlighted() -> RgbImage {
        let mut img = blank();
        draw_filled_rect_mut(
            &mut img,
            imageproc::rect::Rect::at(50, 100).of_size(200, 30),
            YELLOW,
        );
        img
    }

    /// What a faulty capture call returns
    #[derive(Clone, Copy)]
    enum Fault {
        Error,
        Corrupt,
    }

    /// In-memory page source
    struct MemorySource {
        pages: Vec<RgbImage>,
        active: bool,
        current: Mutex<u32>,
        visits: Mutex<Vec<u32>>,
        captures: Mutex<usize>,
        cancel_on: Option<(u32, CancellationToken)>,
        fail_capture_on: Option<u32>,
        /// Fault injected on the n-th capture call (1-based)
        fault_on_capture: Option<(usize, Fault)>,
        stall: Option<Duration>,
    }

    impl MemorySource {
        fn new(pages: Vec<RgbImage>) -> Self {
            Self {
                pages,
                active: true,
                current: Mutex::new(0),
                visits: Mutex::new(Vec::new()),
                captures: Mutex::new(0),
                cancel_on: None,
                fail_capture_on: None,
                fault_on_capture: None,
                stall: None,
            }
        }
    }

    #[async_trait]
    impl PageSource for MemorySource {
        async fn navigate_to(&self, page: u32) -> Result<()> {
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            *self.current.lock() = page;
            self.visits.lock().push(page);
            if let Some((at, token)) = &self.cancel_on {
                if *at == page {
                    token.cancel();
                }
            }
            Ok(())
        }

        async fn capture_frame(&self) -> Result<CapturedFrame> {
            let page = *self.current.lock();
            let call = {
                let mut captures = self.captures.lock();
                *captures += 1;
                *captures
            };
            if self.fail_capture_on == Some(page) {
                bail!("capture device lost");
            }
            match self.fault_on_capture {
                Some((at, Fault::Error)) if at == call => bail!("capture device lost"),
                Some((at, Fault::Corrupt)) if at == call => {
                    return Ok(CapturedFrame::encoded(b"not really a png".to_vec()))
                }
                _ => {}
            }
            let image = self.pages[page as usize - 1].clone();
            Ok(CapturedFrame::from_image(&DynamicImage::ImageRgb8(image)))
        }

        async fn is_target_active(&self) -> bool {
            self.active
        }
    }

    struct FixedEngine {
        available: bool,
        confidence: f32,
    }

    #[async_trait]
    impl RecognitionEngine for FixedEngine {
        async fn recognize_tokens(&self, _image: &RgbImage, _mode: SegmentationMode) -> Result<Vec<Token>> {
            Ok(vec![
                Token::new("Highlighted", self.confidence),
                Token::new("passage", self.confidence),
            ])
        }

        async fn is_available(&self) -> bool {
            self.available
        }
    }

    #[derive(Default)]
    struct CountingRepository {
        saved: Mutex<Vec<(TaskStatus, usize)>>,
    }

    #[async_trait]
    impl HighlightRepository for CountingRepository {
        async fn save(&self, task: &Task) -> Result<Vec<PathBuf>> {
            self.saved.lock().push((task.status(), task.highlight_count()));
            Ok(vec![])
        }
    }

    /// Subscriber recording every event
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: Arc<Event>) -> Result<()> {
            self.events.lock().push((*event).clone());
            Ok(())
        }
    }

    impl Recorder {
        fn count(&self, kind: EventKind) -> usize {
            self.events.lock().iter().filter(|e| e.kind() == kind).count()
        }

        fn progress(&self) -> Vec<f32> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match &e.payload {
                    EventPayload::TaskProgress { progress, .. } => Some(*progress),
                    _ => None,
                })
                .collect()
        }
    }

    fn params(total: u32) -> ExtractionParams {
        ExtractionParams {
            scan_regions: vec![Rect::new(0, 0, 400, 300)],
            navigation_delay: Duration::ZERO,
            ocr_delay: Duration::ZERO,
            ..ExtractionParams::new(total)
        }
    }

    fn orchestrator(source: MemorySource, engine: FixedEngine) -> (ExtractionOrchestrator, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let orchestrator = ExtractionOrchestrator::new(
            Arc::new(source),
            Arc::new(RegionDetector::new()),
            Arc::new(TextExtractor::new(Arc::new(engine))),
            ReadingMode::PerHighlight,
        );
        orchestrator.events().subscribe_all(recorder.clone());
        (orchestrator, recorder)
    }

    fn good_engine() -> FixedEngine {
        FixedEngine {
            available: true,
            confidence: 90.0,
        }
    }

    #[tokio::test]
    async fn test_three_page_run() {
        let source = MemorySource::new(vec![highlighted(), blank(), highlighted()]);
        let (orchestrator, recorder) = orchestrator(source, good_engine());

        let task = orchestrator.run(params(3)).await.unwrap();

        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.pages_scanned, 3);
        assert_eq!(task.pages_with_content, 2);
        assert_eq!(task.highlight_count(), 2);
        let pages: Vec<u32> = task.highlights().iter().map(|h| h.page_number()).collect();
        assert_eq!(pages, vec![1, 3]);
        assert!(task.highlights().iter().all(|h| h.highlight_number() == 1));
        assert!(task.highlights().iter().all(|h| h.text() == "Highlighted passage"));
        assert!(task.started_at().is_some() && task.completed_at().is_some());

        assert_eq!(recorder.count(EventKind::TaskStarted), 1);
        assert_eq!(recorder.count(EventKind::HighlightFound), 2);
        assert_eq!(recorder.count(EventKind::TaskCompleted), 1);
        assert_eq!(recorder.count(EventKind::TaskFailed), 0);
    }

    #[tokio::test]
    async fn test_progress_bands() {
        let source = MemorySource::new(vec![highlighted(), blank(), highlighted(), blank()]);
        let (orchestrator, recorder) = orchestrator(source, good_engine());

        orchestrator.run(params(4)).await.unwrap();

        let progress = recorder.progress();
        assert_eq!(progress.len(), 4 + 2);

        let (scan, extract) = progress.split_at(4);
        assert!(scan.windows(2).all(|w| w[0] <= w[1]), "{:?}", scan);
        assert!(scan.iter().all(|p| (0.0..=50.0).contains(p)));
        assert_eq!(scan[3], 50.0);
        assert!(extract.iter().all(|p| (50.0..=100.0).contains(p)));
        assert_eq!(extract, &[75.0, 100.0]);
    }

    #[tokio::test]
    async fn test_partial_range() {
        let source = MemorySource::new(vec![highlighted(), highlighted(), highlighted(), highlighted()]);
        let (orchestrator, recorder) = orchestrator(source, good_engine());

        let mut p = params(4);
        p.start_page = 2;
        p.end_page = Some(3);
        let task = orchestrator.run(p).await.unwrap();

        assert_eq!(task.pages_scanned, 2);
        let pages: Vec<u32> = task.highlights().iter().map(|h| h.page_number()).collect();
        assert_eq!(pages, vec![2, 3]);
        assert!(recorder.progress().iter().take(2).all(|p| *p <= 50.0));
    }

    #[tokio::test]
    async fn test_cancel_during_scan() {
        let token = CancellationToken::new();
        let mut source = MemorySource::new(vec![highlighted(), highlighted(), highlighted()]);
        source.cancel_on = Some((2, token.clone()));
        let (orchestrator, recorder) = orchestrator(source, good_engine());
        let orchestrator = orchestrator.with_cancellation_token(token);

        let task = orchestrator.run(params(3)).await.unwrap();

        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert_eq!(task.pages_scanned, 2);
        assert!(task.pages_scanned < 3);
        assert_eq!(task.highlight_count(), 0);
        assert_eq!(recorder.count(EventKind::HighlightFound), 0);
        assert_eq!(recorder.count(EventKind::TaskCancelled), 1);
        assert_eq!(recorder.count(EventKind::TaskCompleted), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_extraction_keeps_finished_pages() {
        let token = CancellationToken::new();
        let source = Arc::new(MemorySource::new(vec![highlighted(), highlighted(), highlighted()]));
        let repository = Arc::new(CountingRepository::default());
        let recorder = Arc::new(Recorder::default());

        let orchestrator = ExtractionOrchestrator::new(
            source.clone(),
            Arc::new(RegionDetector::new()),
            Arc::new(TextExtractor::new(Arc::new(good_engine()))),
            ReadingMode::PerHighlight,
        )
        .with_cancellation_token(token.clone())
        .with_repository(repository.clone());
        orchestrator.events().subscribe_all(recorder.clone());

        let cancel_after_first = {
            let token = token.clone();
            Arc::new(move |_event: Arc<Event>| {
                let token = token.clone();
                async move {
                    token.cancel();
                    Ok::<(), anyhow::Error>(())
                }
            })
        };
        orchestrator.events().subscribe(EventKind::HighlightFound, cancel_after_first);

        let task = orchestrator.run(params(3)).await.unwrap();

        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert_eq!(task.pages_scanned, 3);
        assert_eq!(task.highlight_count(), 1);
        assert_eq!(recorder.count(EventKind::TaskCancelled), 1);
        assert_eq!(*repository.saved.lock(), vec![(TaskStatus::Cancelled, 1)]);
        assert_eq!(*source.visits.lock(), vec![1, 2, 3, 1]);
    }

    #[tokio::test]
    async fn test_unavailable_engine_is_prerequisite_error() {
        let source = MemorySource::new(vec![highlighted()]);
        let engine = FixedEngine {
            available: false,
            confidence: 90.0,
        };
        let (orchestrator, recorder) = orchestrator(source, engine);

        let err = orchestrator.run(params(1)).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Prerequisite(_)));
        assert!(err.task().is_none());
        assert!(recorder.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_source_is_prerequisite_error() {
        let mut source = MemorySource::new(vec![highlighted()]);
        source.active = false;
        let (orchestrator, recorder) = orchestrator(source, good_engine());

        let err = orchestrator.run(params(1)).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Prerequisite(_)));
        assert!(recorder.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_parameters_rejected() {
        let (orchestrator, recorder) = orchestrator(MemorySource::new(vec![blank()]), good_engine());

        let mut p = params(3);
        p.start_page = 0;
        assert!(matches!(orchestrator.run(p).await, Err(ExtractionError::InvalidParameters(_))));

        let mut p = params(3);
        p.end_page = Some(4);
        assert!(matches!(orchestrator.run(p).await, Err(ExtractionError::InvalidParameters(_))));

        let mut p = params(3);
        p.start_page = 3;
        p.end_page = Some(2);
        assert!(matches!(orchestrator.run(p).await, Err(ExtractionError::InvalidParameters(_))));

        let mut p = params(3);
        p.scan_regions.clear();
        assert!(matches!(orchestrator.run(p).await, Err(ExtractionError::InvalidParameters(_))));

        assert!(matches!(orchestrator.run(params(0)).await, Err(ExtractionError::InvalidParameters(_))));
        assert!(recorder.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_capture_failure_fails_task() {
        let mut source = MemorySource::new(vec![highlighted(), highlighted(), blank()]);
        source.fail_capture_on = Some(2);
        let (orchestrator, recorder) = orchestrator(source, good_engine());

        let err = orchestrator.run(params(3)).await.unwrap_err();
        let task = err.task().expect("failed task attached");

        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("capture device lost"));
        assert!(task.completed_at().is_some());
        assert_eq!(recorder.count(EventKind::TaskFailed), 1);
        assert_eq!(recorder.count(EventKind::TaskCompleted), 0);
    }

    #[tokio::test]
    async fn test_low_confidence_readings_dropped() {
        let source = MemorySource::new(vec![highlighted(), highlighted()]);
        let engine = FixedEngine {
            available: true,
            confidence: 20.0,
        };
        let (orchestrator, recorder) = orchestrator(source, engine);

        let task = orchestrator.run(params(2)).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.pages_with_content, 2);
        assert_eq!(task.highlight_count(), 0);
        assert_eq!(recorder.count(EventKind::HighlightFound), 0);
    }

    #[tokio::test]
    async fn test_no_flagged_pages_still_completes() {
        let repository = Arc::new(CountingRepository::default());
        let (orchestrator, recorder) = orchestrator(MemorySource::new(vec![blank(), blank()]), good_engine());
        let orchestrator = orchestrator.with_repository(repository.clone());

        let task = orchestrator.run(params(2)).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.pages_with_content, 0);
        assert_eq!(recorder.progress().len(), 2);
        assert!(repository.saved.lock().is_empty());
    }

    #[tokio::test]
    async fn test_multiple_highlights_numbered_top_down() {
        let mut page = highlighted();
        draw_filled_rect_mut(&mut page, imageproc::rect::Rect::at(60, 200).of_size(220, 28), YELLOW);
        let (orchestrator, _) = orchestrator(MemorySource::new(vec![page]), good_engine());

        let task = orchestrator.run(params(1)).await.unwrap();
        let numbered: Vec<(u32, u32)> = task
            .highlights()
            .iter()
            .map(|h| (h.highlight_number(), h.position().y))
            .collect();
        assert_eq!(numbered, vec![(1, 96), (2, 196)]);
    }

    #[tokio::test]
    async fn test_whole_region_mode() {
        let source = Arc::new(MemorySource::new(vec![highlighted(), blank()]));
        let orchestrator = ExtractionOrchestrator::new(
            source,
            Arc::new(RegionDetector::new()),
            Arc::new(TextExtractor::new(Arc::new(good_engine()))),
            ReadingMode::WholeRegion,
        );

        let mut p = params(2);
        p.scan_regions = vec![Rect::new(0, 0, 400, 300), Rect::new(0, 150, 400, 150)];
        let task = orchestrator.run(p).await.unwrap();

        assert_eq!(task.pages_with_content, 1);
        let numbered: Vec<u32> = task.highlights().iter().map(|h| h.highlight_number()).collect();
        assert_eq!(numbered, vec![1, 2]);
        assert_eq!(task.highlights()[1].position(), Rect::new(0, 150, 400, 150));
    }

    #[tokio::test]
    async fn test_stalled_source_times_out() {
        let mut source = MemorySource::new(vec![highlighted()]);
        source.stall = Some(Duration::from_millis(500));
        let (orchestrator, recorder) = orchestrator(source, good_engine());
        let orchestrator = orchestrator.with_timeout(Some(Duration::from_millis(20)));

        let err = orchestrator.run(params(1)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{}", err);
        assert_eq!(recorder.count(EventKind::TaskFailed), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let (orchestrator, recorder) = orchestrator(MemorySource::new(vec![highlighted()]), good_engine());
        orchestrator.cancel();

        let task = orchestrator.run(params(1)).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert_eq!(task.pages_scanned, 0);
        assert_eq!(recorder.count(EventKind::TaskStarted), 1);

        orchestrator.reset_cancellation();
        let task = orchestrator.run(params(1)).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_undecodable_page_during_scan_counts_as_empty() {
        let mut source = MemorySource::new(vec![highlighted(), highlighted(), highlighted()]);
        source.fault_on_capture = Some((2, Fault::Corrupt));
        let (orchestrator, recorder) = orchestrator(source, good_engine());

        let task = orchestrator.run(params(3)).await.unwrap();

        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.pages_scanned, 3);
        assert_eq!(task.pages_with_content, 2);
        let pages: Vec<u32> = task.highlights().iter().map(|h| h.page_number()).collect();
        assert_eq!(pages, vec![1, 3]);
        assert_eq!(recorder.count(EventKind::TaskFailed), 0);
    }

    #[tokio::test]
    async fn test_corrupt_file_in_page_directory_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        highlighted().save(dir.path().join("p1.png")).unwrap();
        std::fs::write(dir.path().join("p2.png"), b"not really a png").unwrap();
        highlighted().save(dir.path().join("p3.png")).unwrap();

        let orchestrator = ExtractionOrchestrator::new(
            Arc::new(DirectoryPageSource::new(dir.path())),
            Arc::new(RegionDetector::new()),
            Arc::new(TextExtractor::new(Arc::new(good_engine()))),
            ReadingMode::PerHighlight,
        );

        let task = orchestrator.run(params(3)).await.unwrap();

        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.pages_scanned, 3);
        assert_eq!(task.highlight_count(), 2);
    }

    #[tokio::test]
    async fn test_undecodable_page_during_extraction_fails_task() {
        let mut source = MemorySource::new(vec![highlighted(), highlighted()]);
        // Captures 1-2 scan, 3-4 extract
        source.fault_on_capture = Some((4, Fault::Corrupt));
        let (orchestrator, recorder) = orchestrator(source, good_engine());

        let err = orchestrator.run(params(2)).await.unwrap_err();
        let task = err.task().expect("failed task attached");

        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("Unusable frame for page 2"));
        assert_eq!(recorder.count(EventKind::TaskFailed), 1);
    }

    #[tokio::test]
    async fn test_failed_run_with_highlights_is_persisted() {
        let mut source = MemorySource::new(vec![highlighted(), highlighted()]);
        source.fault_on_capture = Some((4, Fault::Error));
        let repository = Arc::new(CountingRepository::default());
        let (orchestrator, recorder) = orchestrator(source, good_engine());
        let orchestrator = orchestrator.with_repository(repository.clone());

        let err = orchestrator.run(params(2)).await.unwrap_err();
        let task = err.task().expect("failed task attached");

        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.highlight_count(), 1);
        assert_eq!(*repository.saved.lock(), vec![(TaskStatus::Failed, 1)]);
        assert_eq!(recorder.count(EventKind::TaskFailed), 1);
        assert_eq!(recorder.count(EventKind::HighlightFound), 1);
    }
}
