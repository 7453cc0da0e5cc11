//! Ingestion Pipeline
//!
//! Drives a source file through normalization, digesting, dedup resolution, chunk
//! encoding and publication on the load channel. Directory scans fan files out
//! with bounded concurrency; each file succeeds or fails on its own.

pub mod watch;

use crate::bus::{publish_with_retry, MessageBus};
use crate::codec;
use crate::dedup::DedupCoordinator;
use crate::error::SorterError;
use crate::imaging::ImageCodec;
use crate::retry::RetryPolicy;
use crate::types::{ContentDigest, LogicalIdentity};
use comfy_table::{presets::UTF8_FULL, Table};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub use watch::{WatchIngestor, WatchReport};

/// Default chunk payload size (512 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Ingestion settings (`[ingest]` in the config file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Host part of every identity; detected when unset
    #[serde(default)]
    pub host: Option<String>,
    /// Maximum payload bytes per chunk message
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Files ingested concurrently during a directory scan
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// File name patterns skipped by scans and the watcher
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
    /// Quiet period before a watched file is ingested (milliseconds)
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_concurrency() -> usize {
    4
}

fn default_ignore_patterns() -> Vec<String> {
    vec![".*".to_string(), "*.tmp".to_string(), "*.swp".to_string()]
}

fn default_settle_ms() -> u64 {
    200
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            host: None,
            chunk_size: default_chunk_size(),
            concurrency: default_concurrency(),
            ignore_patterns: default_ignore_patterns(),
            settle_ms: default_settle_ms(),
        }
    }
}

/// Match a file name against simple `*` patterns: `*.tmp`, `.*`, `name*`, `exact`.
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    match pattern.split_once('*') {
        None => name == pattern,
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
    }
}

pub fn is_ignored(path: &Path, patterns: &[String]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    patterns.iter().any(|p| matches_pattern(name, p))
}

/// Host name for identities: configured value, then `hostname -s`, then the
/// `HOSTNAME` variable, then `localhost`.
pub fn detect_host(configured: Option<&str>) -> String {
    if let Some(host) = configured.map(str::trim).filter(|h| !h.is_empty()) {
        return host.to_string();
    }

    let from_command = std::process::Command::new("hostname")
        .arg("-s")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(host) = from_command {
        return sanitize_host(&host);
    }

    std::env::var("HOSTNAME")
        .ok()
        .map(|h| sanitize_host(h.trim()))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn sanitize_host(raw: &str) -> String {
    raw.chars()
        .map(|c| if c == ':' || c == '|' { '-' } else { c })
        .collect()
}

/// Result of ingesting one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Published {
        identity: LogicalIdentity,
        digest: ContentDigest,
        chunks: usize,
        bytes: usize,
    },
    /// Same content was already ingested; `host` stored it first.
    Duplicate {
        host: String,
        existing: LogicalIdentity,
    },
}

/// Per-file results of a directory scan.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub published: Vec<(PathBuf, LogicalIdentity, usize)>,
    pub duplicates: Vec<(PathBuf, String)>,
    pub failed: Vec<(PathBuf, String)>,
}

impl ScanReport {
    pub fn total(&self) -> usize {
        self.published.len() + self.duplicates.len() + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, path: PathBuf, result: Result<IngestOutcome, SorterError>) {
        match result {
            Ok(IngestOutcome::Published {
                identity, chunks, ..
            }) => self.published.push((path, identity, chunks)),
            Ok(IngestOutcome::Duplicate { host, .. }) => self.duplicates.push((path, host)),
            Err(e) => self.failed.push((path, e.to_string())),
        }
    }

    /// Render as a table, one row per file, sorted by path.
    pub fn render_table(&self) -> String {
        let mut rows: Vec<(String, String, String)> = Vec::with_capacity(self.total());
        for (path, identity, chunks) in &self.published {
            rows.push((
                path.display().to_string(),
                "loaded".to_string(),
                format!("{} ({} chunk(s))", identity, chunks),
            ));
        }
        for (path, host) in &self.duplicates {
            rows.push((
                path.display().to_string(),
                "duplicate".to_string(),
                format!("already processed on host {}", host),
            ));
        }
        for (path, reason) in &self.failed {
            rows.push((path.display().to_string(), "failed".to_string(), reason.clone()));
        }
        rows.sort();

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["File", "Status", "Detail"]);
        for (path, status, detail) in rows {
            table.add_row(vec![path, status, detail]);
        }
        table.to_string()
    }
}

pub struct Ingestor {
    bus: Arc<dyn MessageBus>,
    coordinator: Arc<DedupCoordinator>,
    codec: Arc<dyn ImageCodec>,
    host: String,
    channel: String,
    config: IngestConfig,
    retry: RetryPolicy,
}

impl Ingestor {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        coordinator: Arc<DedupCoordinator>,
        codec: Arc<dyn ImageCodec>,
        channel: impl Into<String>,
        config: IngestConfig,
        retry: RetryPolicy,
    ) -> Result<Self, SorterError> {
        if config.chunk_size == 0 {
            return Err(SorterError::ConfigError(
                "ingest.chunk_size must be at least 1".to_string(),
            ));
        }
        let host = detect_host(config.host.as_deref());
        Ok(Self {
            bus,
            coordinator,
            codec,
            host,
            channel: channel.into(),
            config,
            retry,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Ingest one file. Duplicates are an outcome, not an error.
    pub async fn ingest(&self, path: &Path) -> Result<IngestOutcome, SorterError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| SorterError::InvalidPath {
                path: path.to_path_buf(),
                reason: "file name is missing or not valid UTF-8".to_string(),
            })?;

        let codec = Arc::clone(&self.codec);
        let source = path.to_path_buf();
        let bytes = tokio::task::spawn_blocking(move || codec.normalize(&source)).await??;
        let digest = ContentDigest::of(&bytes);
        debug!(path = %path.display(), digest = %digest, size = bytes.len(), "Normalized image");

        let coordinator = Arc::clone(&self.coordinator);
        let host = self.host.clone();
        let resolved =
            tokio::task::spawn_blocking(move || coordinator.resolve(&host, &name, digest)).await?;
        let identity = match resolved {
            Ok(identity) => identity,
            Err(SorterError::DuplicateArtifact { host, existing }) => {
                info!(
                    path = %path.display(),
                    host = %host,
                    existing = %existing,
                    "Same image was processed by agent on another host, skipping"
                );
                return Ok(IngestOutcome::Duplicate { host, existing });
            }
            Err(e) => return Err(e),
        };

        let chunks = codec::encode(&identity, &bytes, self.config.chunk_size)?;
        for chunk in &chunks {
            publish_with_retry(
                self.bus.as_ref(),
                &self.retry,
                &self.channel,
                &chunk.to_wire(),
            )
            .await?;
            debug!(identity = %identity, chunk = chunk.index, count = chunk.count, "Sent chunk");
        }

        info!(
            identity = %identity,
            chunks = chunks.len(),
            bytes = bytes.len(),
            "Image loaded"
        );
        Ok(IngestOutcome::Published {
            identity,
            digest,
            chunks: chunks.len(),
            bytes: bytes.len(),
        })
    }

    /// Regular files directly inside `dir`, sorted, minus ignored names.
    pub fn scan_entries(&self, dir: &Path) -> Result<Vec<PathBuf>, SorterError> {
        if !dir.is_dir() {
            return Err(SorterError::InvalidPath {
                path: dir.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }
        let mut paths = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_type().is_file()
                && !is_ignored(entry.path(), &self.config.ignore_patterns)
            {
                paths.push(entry.into_path());
            }
        }
        Ok(paths)
    }

    /// Ingest every file directly inside `dir`.
    ///
    /// A failing file is recorded in the report and does not stop the scan.
    pub async fn ingest_dir(&self, dir: &Path) -> Result<ScanReport, SorterError> {
        let paths = self.scan_entries(dir)?;
        info!(dir = %dir.display(), files = paths.len(), "Scanning directory");
        Ok(self.ingest_all(paths).await)
    }

    pub(crate) async fn ingest_all(&self, paths: Vec<PathBuf>) -> ScanReport {
        let concurrency = self.config.concurrency.max(1);
        let results: Vec<(PathBuf, Result<IngestOutcome, SorterError>)> = stream::iter(paths)
            .map(|path| async move {
                let result = self.ingest(&path).await;
                (path, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = ScanReport::default();
        for (path, result) in results {
            if let Err(e) = &result {
                warn!(path = %path.display(), error = %e, "Failed to load image");
            }
            report.record(path, result);
        }
        report
    }
}
