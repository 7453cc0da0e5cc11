//! Watch-mode ingestion.
//!
//! The notify watcher only pushes events onto a channel; the ingest loop drains
//! that channel, waits for each new file to settle, and feeds it through the
//! [`Ingestor`]. On shutdown the watcher is dropped first, then whatever is still
//! queued is ingested before returning.

use super::{is_ignored, Ingestor, ScanReport};
use crate::error::SorterError;
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// What a filesystem event means for the watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Observed {
    /// A file appeared: created here or moved in.
    Arrived(PathBuf),
    /// An existing file was written to.
    Written(PathBuf),
}

/// Map a notify event onto the watched directory `root` (canonical).
///
/// Only direct children of `root` count; a rename whose destination is elsewhere
/// is ignored.
pub(crate) fn classify_event(event: &Event, root: &Path, ignore: &[String]) -> Option<Observed> {
    let observed = match event.kind {
        EventKind::Create(CreateKind::Folder) => return None,
        EventKind::Create(_) => Observed::Arrived(event.paths.first()?.clone()),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            Observed::Arrived(event.paths.first()?.clone())
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            Observed::Arrived(event.paths.get(1)?.clone())
        }
        EventKind::Modify(ModifyKind::Name(_)) => return None,
        EventKind::Modify(_) => Observed::Written(event.paths.first()?.clone()),
        _ => return None,
    };

    let path = match &observed {
        Observed::Arrived(p) | Observed::Written(p) => p,
    };
    let in_root = path.parent().map(|parent| parent == root).unwrap_or(false);
    if !in_root || is_ignored(path, ignore) {
        return None;
    }
    Some(observed)
}

/// New files waiting for writes to stop before ingestion.
#[derive(Debug, Default)]
pub(crate) struct PendingFiles {
    last_activity: HashMap<PathBuf, Instant>,
}

impl PendingFiles {
    pub(crate) fn observe(&mut self, observed: Observed, now: Instant) {
        match observed {
            Observed::Arrived(path) => {
                self.last_activity.insert(path, now);
            }
            Observed::Written(path) => {
                if let Some(at) = self.last_activity.get_mut(&path) {
                    *at = now;
                }
            }
        }
    }

    /// Remove and return files idle for at least `settle`, sorted.
    pub(crate) fn take_settled(&mut self, now: Instant, settle: Duration) -> Vec<PathBuf> {
        let mut ready: Vec<PathBuf> = self
            .last_activity
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= settle)
            .map(|(path, _)| path.clone())
            .collect();
        ready.sort();
        for path in &ready {
            self.last_activity.remove(path);
        }
        ready
    }

    pub(crate) fn drain(&mut self) -> Vec<PathBuf> {
        let mut all: Vec<PathBuf> = self.last_activity.drain().map(|(path, _)| path).collect();
        all.sort();
        all
    }

    pub(crate) fn len(&self) -> usize {
        self.last_activity.len()
    }
}

/// Everything ingested during one watch session.
#[derive(Debug, Default)]
pub struct WatchReport {
    /// Files present when watching started
    pub initial: ScanReport,
    /// Files that arrived while watching
    pub watched: ScanReport,
}

impl WatchReport {
    fn absorb(&mut self, batch: ScanReport) {
        self.watched.published.extend(batch.published);
        self.watched.duplicates.extend(batch.duplicates);
        self.watched.failed.extend(batch.failed);
    }
}

pub struct WatchIngestor {
    ingestor: Arc<Ingestor>,
}

impl WatchIngestor {
    pub fn new(ingestor: Arc<Ingestor>) -> Self {
        Self { ingestor }
    }

    /// Ingest `dir` and then everything created in or moved into it, until
    /// `shutdown` flips to true or its sender goes away.
    pub async fn run(
        &self,
        dir: &Path,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WatchReport, SorterError> {
        if !dir.is_dir() {
            return Err(SorterError::InvalidPath {
                path: dir.to_path_buf(),
                reason: "watch mode requires a directory".to_string(),
            });
        }
        let root = dunce::canonicalize(dir)?;
        let config = self.ingestor.config().clone();

        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        debug!("Watch event dropped after shutdown");
                    }
                }
                Err(e) => warn!("Watch error: {}", e),
            }
        })
        .map_err(|e| watcher_error("create watcher", e))?;
        watcher
            .watch(&root, RecursiveMode::NonRecursive)
            .map_err(|e| watcher_error("watch directory", e))?;
        info!(dir = %root.display(), "Watching directory");

        let mut report = WatchReport {
            initial: self.ingestor.ingest_dir(&root).await?,
            ..WatchReport::default()
        };

        let settle = Duration::from_millis(config.settle_ms);
        let mut tick = tokio::time::interval(settle.max(Duration::from_millis(10)) / 2);
        let mut pending = PendingFiles::default();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(event) = rx.recv() => {
                    if let Some(observed) = classify_event(&event, &root, &config.ignore_patterns) {
                        debug!(?observed, "Observed change");
                        pending.observe(observed, Instant::now());
                    }
                }
                _ = tick.tick() => {
                    let ready = pending.take_settled(Instant::now(), settle);
                    if !ready.is_empty() {
                        report.absorb(self.ingest_existing(ready).await);
                    }
                }
            }
        }

        drop(watcher);
        while let Ok(event) = rx.try_recv() {
            if let Some(observed) = classify_event(&event, &root, &config.ignore_patterns) {
                pending.observe(observed, Instant::now());
            }
        }
        info!(queued = pending.len(), "Watcher stopped, draining queued files");
        report.absorb(self.ingest_existing(pending.drain()).await);

        Ok(report)
    }

    async fn ingest_existing(&self, paths: Vec<PathBuf>) -> ScanReport {
        let present: Vec<PathBuf> = paths
            .into_iter()
            .filter(|p| {
                let exists = p.is_file();
                if !exists {
                    debug!(path = %p.display(), "File vanished before ingestion");
                }
                exists
            })
            .collect();
        self.ingestor.ingest_all(present).await
    }
}

fn watcher_error(action: &str, err: notify::Error) -> SorterError {
    SorterError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("Failed to {}: {}", action, err),
    ))
}
