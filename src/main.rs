//! HighlightHarvester - command-line extraction runner
//!
//! Replays a directory of page screenshots through the extraction pipeline
//! and writes JSON and text reports of every recognized highlight.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use highlight_harvester::capture::DirectoryPageSource;
use highlight_harvester::config::{self, AppConfig};
use highlight_harvester::extraction::{
    Event, EventPayload, ExtractionOrchestrator, ReadingMode, Task,
};
use highlight_harvester::storage::{self, ReportRepository};
use highlight_harvester::vision::{
    DiagnosticsSink, DirectorySink, NoopSink, RegionDetector, TesseractEngine, TextExtractor,
};

/// HighlightHarvester - extract highlighted passages from page screenshots
#[derive(Parser, Debug)]
#[command(name = "highlight-harvester")]
#[command(about = "Finds highlighted passages on captured pages and recognizes their text")]
struct Args {
    /// Directory holding one screenshot per page, ordered by file name
    #[arg(short, long)]
    pages: PathBuf,

    /// Total page count (defaults to the number of images found)
    #[arg(long)]
    total: Option<u32>,

    /// First page to process
    #[arg(long, default_value = "1")]
    start: u32,

    /// Last page to process (defaults to the total)
    #[arg(long)]
    end: Option<u32>,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Report output directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Reading strategy: per_highlight or whole_region
    #[arg(long)]
    mode: Option<ReadingMode>,

    /// Book identifier attached to every highlight
    #[arg(long)]
    book_id: Option<Uuid>,

    /// Write intermediate detection and recognition images here
    #[arg(long)]
    dump_images: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("HighlightHarvester starting...");

    let config = load_or_create_config(args.config.as_deref())?;

    let dump_dir = args.dump_images.clone().or_else(|| config.diagnostics.image_dump_dir.clone());
    let sink: Arc<dyn DiagnosticsSink> = match dump_dir {
        Some(dir) => {
            info!("Writing diagnostic images to {:?}", dir);
            Arc::new(DirectorySink::new(dir)?)
        }
        None => Arc::new(NoopSink),
    };

    let timeout = config.extraction.collaborator_timeout();
    let detector = Arc::new(RegionDetector::with_config(config.detection.clone()).with_sink(sink.clone()));
    let engine = Arc::new(TesseractEngine::new(config.tesseract.clone()));
    let extractor = Arc::new(
        TextExtractor::with_config(engine, config.recognition.clone())
            .with_sink(sink)
            .with_timeout(timeout),
    );

    let source = Arc::new(DirectoryPageSource::new(&args.pages));
    let total = match args.total {
        Some(total) => total,
        None => source.page_count()?,
    };

    let output_dir = match args.output.clone().or_else(|| config.output.directory.clone()) {
        Some(dir) => dir,
        None => storage::default_output_dir()?,
    };
    let repository = Arc::new(ReportRepository::new(&output_dir)?);
    info!("Reports will be written to {:?}", repository.output_dir());

    let mode = args.mode.unwrap_or(config.extraction.mode);
    info!("Reading mode: {:?}", mode);

    let orchestrator = ExtractionOrchestrator::new(source, detector, extractor, mode)
        .with_repository(repository)
        .with_timeout(timeout);
    orchestrator.events().subscribe_all(Arc::new(log_event));

    // Ctrl-C stops the run after the current page
    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current page");
            token.cancel();
        }
    });

    let mut params = config.extraction.to_params(total);
    params.start_page = args.start;
    params.end_page = args.end;
    params.book_id = args.book_id;

    match orchestrator.run(params).await {
        Ok(task) => {
            print_summary(&task);
            info!("HighlightHarvester finished");
            Ok(())
        }
        Err(e) => {
            if let Some(task) = e.task() {
                print_summary(task);
            }
            Err(e.into())
        }
    }
}

/// Load configuration from file or create default
fn load_or_create_config(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        let config = config::load_config(path)?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    let config_path = storage::get_config_dir()
        .context("Could not resolve the configuration directory")?
        .join("config.toml");
    if config_path.exists() {
        let config = config::load_config(&config_path)?;
        info!("Loaded configuration from {:?}", config_path);
        return Ok(config);
    }

    let config = AppConfig::default();
    match config::save_config(&config, &config_path) {
        Ok(()) => info!("Wrote default configuration to {:?}", config_path),
        Err(e) => warn!("Could not write default configuration: {:#}", e),
    }
    Ok(config)
}

/// Log every published event
async fn log_event(event: Arc<Event>) -> Result<()> {
    match &event.payload {
        EventPayload::TaskStarted { task } => info!("Task {} started", task.id),
        EventPayload::TaskProgress { progress, message, .. } => {
            info!("[{:5.1}%] {}", progress, message)
        }
        EventPayload::HighlightFound { highlight, .. } => info!(
            "{} ({:.0}%): {}",
            highlight.display_title(),
            highlight.confidence(),
            highlight.preview_text()
        ),
        EventPayload::TaskCompleted { task } => {
            info!("Task {} completed with {} highlights", task.id, task.highlight_count())
        }
        EventPayload::TaskCancelled { task } => {
            warn!("Task {} cancelled after {} pages", task.id, task.pages_scanned)
        }
        EventPayload::TaskFailed { task, error } => warn!("Task {} failed: {}", task.id, error),
    }
    debug!("Event at {}", event.timestamp.format("%H:%M:%S%.3f"));
    Ok(())
}

fn print_summary(task: &Task) {
    println!();
    println!("Status:             {:?}", task.status());
    println!("Pages scanned:      {}", task.pages_scanned);
    println!("Pages with content: {}", task.pages_with_content);
    println!("Highlights:         {}", task.highlight_count());
    if let Some(secs) = task.duration() {
        println!("Duration:           {:.1}s", secs);
    }
    if let Some(error) = &task.error {
        println!("Error:              {}", error);
    }
    for highlight in task.highlights() {
        println!();
        println!("{}", highlight.display_title());
        println!("  {}", highlight.preview_text());
    }
}
