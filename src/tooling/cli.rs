//! CLI Tooling
//!
//! Command-line interface for the three agents: `load` publishes images, `process`
//! reassembles and measures them, `sort` classifies them against a palette. Every
//! agent talks to the others only through the shared spool bus.

use crate::bus::{MessageBus, SpoolBus};
use crate::classify::{ClassificationResult, Palette};
use crate::config::{paths, ConfigLoader, SorterConfig};
use crate::dedup::DedupCoordinator;
use crate::error::SorterError;
use crate::imaging::RasterCodec;
use crate::ingest::{IngestOutcome, Ingestor, ScanReport, WatchIngestor};
use crate::logging;
use crate::process::{PipelineStats, ProcessPipeline, SortPipeline};
use crate::store::{DedupIndex, SledDedupIndex};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// kmsorter - distributed image sorter
#[derive(Parser, Debug)]
#[command(name = "kmsorter", version)]
#[command(about = "Image sorter app: load, process and sort images by color")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path (overrides default config loading)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Shorthand for --log-level debug
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file, file+stderr, both)
    #[arg(long, global = true)]
    pub log_output: Option<String>,

    /// Log file path (if output includes "file")
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Spool directory used as the message bus
    #[arg(long, global = true)]
    pub spool_dir: Option<PathBuf>,

    /// Dedup index database directory
    #[arg(long, global = true)]
    pub store_path: Option<PathBuf>,

    /// Host name used in identities (detected when omitted)
    #[arg(long, global = true)]
    pub host: Option<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Load an image, or every image in a directory, onto the bus
    Load {
        /// Keep running and load images created in or moved into the directory
        #[arg(long)]
        watch: bool,
        /// Maximum payload bytes per chunk message
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Image file or directory
        path: PathBuf,
    },
    /// Run the image processor of loaded images
    Process {
        /// Also classify against this color, e.g. "#0E96B4" (repeatable)
        #[arg(short = 'c', long = "color", value_name = "HEX")]
        colors: Vec<String>,
    },
    /// Run the image sorter of processed images against the given colors
    Sort {
        /// Color in hexadecimal format, e.g. "#0E96B4" (repeatable)
        #[arg(short = 'c', long = "color", value_name = "HEX", required = true)]
        colors: Vec<String>,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Load { .. } => "load",
            Commands::Process { .. } => "process",
            Commands::Sort { .. } => "sort",
        }
    }
}

impl Cli {
    /// Apply command-line flags on top of a loaded configuration.
    pub fn apply_overrides(&self, config: &mut SorterConfig) {
        if self.debug {
            config.logging.level = "debug".to_string();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }
        if let Some(output) = &self.log_output {
            config.logging.output = output.clone();
        }
        if let Some(file) = &self.log_file {
            config.logging.file = Some(file.clone());
        }
        if let Some(dir) = &self.spool_dir {
            config.bus.spool_dir = Some(dir.clone());
        }
        if let Some(path) = &self.store_path {
            config.store.path = Some(path.clone());
        }
        if let Some(host) = &self.host {
            config.ingest.host = Some(host.clone());
        }
    }
}

/// Shutdown signal that flips to true on Ctrl-C.
///
/// Must be called from within a tokio runtime.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                if tx.send(true).is_err() {
                    debug!("No command was waiting for shutdown");
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for Ctrl-C; stop the agent another way");
                tx.closed().await;
            }
        }
    });
    rx
}

/// CLI context holding the resolved configuration
pub struct CliContext {
    config: SorterConfig,
}

impl CliContext {
    /// Load configuration and apply the command-line overrides.
    pub fn new(cli: &Cli) -> Result<Self, SorterError> {
        let mut config = ConfigLoader::load_with_override(cli.config.as_deref())?;
        cli.apply_overrides(&mut config);
        Ok(Self { config })
    }

    pub fn from_config(config: SorterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SorterConfig {
        &self.config
    }

    pub fn init_logging(&self) -> Result<(), SorterError> {
        logging::init_logging(&self.config.logging)
    }

    /// Connect to the spool bus; failure is a fatal [`SorterError::Connection`].
    pub fn connect_bus(&self) -> Result<Arc<dyn MessageBus>, SorterError> {
        let root = match &self.config.bus.spool_dir {
            Some(dir) => dir.clone(),
            None => paths::default_spool_dir()?,
        };
        let bus = SpoolBus::connect(&root, Duration::from_millis(self.config.bus.poll_interval_ms))
            .map_err(|e| {
                SorterError::Connection(format!(
                    "Failed to connect to message bus at {}: {}",
                    root.display(),
                    e
                ))
            })?;
        debug!(spool = %root.display(), "Connected to message bus");
        Ok(Arc::new(bus))
    }

    /// Open the dedup index; failure is a fatal [`SorterError::Connection`].
    pub fn open_index(&self) -> Result<Arc<dyn DedupIndex>, SorterError> {
        let path = match &self.config.store.path {
            Some(path) => path.clone(),
            None => paths::default_store_path()?,
        };
        let index = SledDedupIndex::open_with_retry(&path, self.config.retry).map_err(|e| {
            SorterError::Connection(format!(
                "Failed to open dedup index at {}: {}",
                path.display(),
                e
            ))
        })?;
        debug!(store = %path.display(), "Opened dedup index");
        Ok(Arc::new(index))
    }

    /// Execute a command. Long-running agents stop when `shutdown` flips.
    pub async fn execute(
        &self,
        command: &Commands,
        shutdown: watch::Receiver<bool>,
    ) -> Result<String, SorterError> {
        debug!(command = command.name(), "Starting agent");
        match command {
            Commands::Load {
                watch,
                chunk_size,
                path,
            } => self.handle_load(path, *watch, *chunk_size, shutdown).await,
            Commands::Process { colors } => self.handle_process(colors, shutdown).await,
            Commands::Sort { colors } => self.handle_sort(colors, shutdown).await,
        }
    }

    async fn handle_load(
        &self,
        path: &Path,
        watch_mode: bool,
        chunk_size: Option<usize>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<String, SorterError> {
        if !path.exists() {
            return Err(SorterError::InvalidPath {
                path: path.to_path_buf(),
                reason: "no such file or directory".to_string(),
            });
        }
        if watch_mode && !path.is_dir() {
            return Err(SorterError::InvalidPath {
                path: path.to_path_buf(),
                reason: "watch mode requires a directory".to_string(),
            });
        }

        let bus = self.connect_bus()?;
        let index = self.open_index()?;
        let coordinator = Arc::new(DedupCoordinator::new(
            index,
            self.config.store.dedup_scope,
            self.config.retry,
        ));
        let mut ingest_config = self.config.ingest.clone();
        if let Some(size) = chunk_size {
            ingest_config.chunk_size = size;
        }
        let ingestor = Arc::new(Ingestor::new(
            bus,
            Arc::clone(&coordinator),
            Arc::new(RasterCodec::new()),
            self.config.bus.load_channel.clone(),
            ingest_config,
            self.config.retry,
        )?);
        info!(host = ingestor.host(), "Starting image loader");

        let output = if watch_mode {
            let report = WatchIngestor::new(Arc::clone(&ingestor))
                .run(path, shutdown)
                .await?;
            format!(
                "{}\n{}\nWatch stopped: {} image(s) loaded while watching.",
                summarize_scan(&report.initial),
                report.watched.render_table(),
                report.watched.published.len()
            )
        } else if path.is_dir() {
            let report = ingestor.ingest_dir(path).await?;
            summarize_scan(&report)
        } else {
            match ingestor.ingest(path).await? {
                IngestOutcome::Published {
                    identity, chunks, ..
                } => format!(
                    "Given path was successfully loaded as {} ({} chunk(s)).",
                    identity, chunks
                ),
                IngestOutcome::Duplicate { host, existing } => format!(
                    "Same image was processed by agent on host {} (as {}).",
                    host, existing
                ),
            }
        };

        coordinator.index().flush()?;
        Ok(output)
    }

    async fn handle_process(
        &self,
        colors: &[String],
        shutdown: watch::Receiver<bool>,
    ) -> Result<String, SorterError> {
        let palette = if colors.is_empty() {
            None
        } else {
            Some(Palette::from_hex(colors)?)
        };
        let bus = self.connect_bus()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut pipeline = ProcessPipeline::new(
            bus,
            Arc::new(RasterCodec::new()),
            &self.config.process,
            self.config.retry,
        )
        .with_channels(
            self.config.bus.load_channel.clone(),
            self.config.bus.process_channel.clone(),
            self.config.bus.sort_channel.clone(),
        );
        if let Some(palette) = palette {
            pipeline = pipeline.with_palette(palette).with_result_sink(tx);
        } else {
            drop(tx);
        }

        let printer = tokio::spawn(print_results(rx));
        let stats = pipeline.run(shutdown).await?;
        drop(pipeline);
        printer.await?;
        Ok(summarize_stats("Processor", &stats))
    }

    async fn handle_sort(
        &self,
        colors: &[String],
        shutdown: watch::Receiver<bool>,
    ) -> Result<String, SorterError> {
        let palette = Palette::from_hex(colors)?;
        let bus = self.connect_bus()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let pipeline = SortPipeline::new(bus, palette, self.config.retry)
            .with_channels(
                self.config.bus.process_channel.clone(),
                self.config.bus.sort_channel.clone(),
            )
            .with_result_sink(tx);

        let printer = tokio::spawn(print_results(rx));
        let stats = pipeline.run(shutdown).await?;
        drop(pipeline);
        printer.await?;
        Ok(summarize_stats("Sorter", &stats))
    }
}

async fn print_results(mut rx: mpsc::UnboundedReceiver<ClassificationResult>) {
    while let Some(result) = rx.recv().await {
        println!("{}", format_result(&result));
    }
}

/// One output line per classified image, led by a swatch of the matched color.
pub fn format_result(result: &ClassificationResult) -> String {
    let c = result.color;
    format!(
        "{} {} {} -> {} (distance {:.1})",
        "  ".on_truecolor(c.r, c.g, c.b),
        result.color.to_hex(),
        result.identity,
        result.palette_index,
        result.distance
    )
}

fn summarize_scan(report: &ScanReport) -> String {
    format!(
        "{}\nLoaded {} image(s), skipped {} duplicate(s), {} failure(s).",
        report.render_table(),
        report.published.len(),
        report.duplicates.len(),
        report.failed.len()
    )
}

fn summarize_stats(agent: &str, stats: &PipelineStats) -> String {
    format!(
        "{} stopped: {} message(s), {} image(s) completed, {} classified, {} dropped, {} stalled, {} failed.",
        agent,
        stats.received,
        stats.completed,
        stats.classified,
        stats.dropped,
        stats.stalled,
        stats.failed
    )
}
