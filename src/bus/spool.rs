//! Spool-directory bus.
//!
//! Each channel is a directory under the spool root. A publish writes one file,
//! first under a hidden temporary name and then renamed into place, so readers
//! never see a partial message. File names sort in publish order:
//!
//! ```text
//! <spool>/<channel>/<unix nanos>-<pid>-<sequence>.msg
//! ```
//!
//! Subscribers poll their channel directory and claim each message by renaming it
//! before reading, so when several consumer processes share a channel every message
//! is delivered to exactly one of them. At most [`SPOOL_PREFETCH`] messages are
//! claimed ahead of the consumer. A claimed file is deleted once the consumer has
//! taken its message; dropping the subscription puts the rest back.

use super::{validate_channel, MessageBus, Subscription};
use crate::error::BusError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const MESSAGE_EXT: &str = "msg";

/// Messages claimed ahead of the consumer per subscription.
pub const SPOOL_PREFETCH: usize = 8;

// TODO: reclaim `.claimed-*` files left behind by a consumer process that was
// killed before it could return them.
pub struct SpoolBus {
    root: PathBuf,
    poll_interval: Duration,
    sequence: AtomicU64,
    subscriptions: AtomicU64,
}

impl SpoolBus {
    /// Open the spool at `root`, creating it if needed.
    pub fn connect(root: &Path, poll_interval: Duration) -> Result<Self, BusError> {
        std::fs::create_dir_all(root).map_err(|e| {
            BusError::Unreachable(format!("cannot create spool {}: {}", root.display(), e))
        })?;
        let metadata = std::fs::metadata(root).map_err(|e| {
            BusError::Unreachable(format!("cannot stat spool {}: {}", root.display(), e))
        })?;
        if metadata.permissions().readonly() {
            return Err(BusError::Unreachable(format!(
                "spool {} is read-only",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
            poll_interval,
            sequence: AtomicU64::new(0),
            subscriptions: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn channel_dir(&self, channel: &str) -> Result<PathBuf, BusError> {
        validate_channel(channel)?;
        Ok(self.root.join(channel))
    }

    fn next_file_name(&self) -> String {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        format!(
            "{:020}-{:010}-{:012}.{}",
            nanos,
            std::process::id(),
            seq,
            MESSAGE_EXT
        )
    }
}

/// Pending message files in delivery order.
async fn pending_messages(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_message = path.extension().and_then(|e| e.to_str()) == Some(MESSAGE_EXT)
            && !entry.file_name().to_string_lossy().starts_with('.');
        if is_message {
            names.push(path);
        }
    }
    names.sort();
    Ok(names)
}

/// A message file renamed out of the pending set, and the name to put it back
/// under.
struct Claimed {
    claimed: PathBuf,
    original: PathBuf,
}

/// Claim a message by renaming it; `None` if another consumer got there first.
async fn claim(path: &Path, tag: &str) -> std::io::Result<Option<(Claimed, Vec<u8>)>> {
    let claimed = path.with_extension(tag);
    match tokio::fs::rename(path, &claimed).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    }
    match tokio::fs::read(&claimed).await {
        Ok(payload) => Ok(Some((
            Claimed {
                claimed,
                original: path.to_path_buf(),
            },
            payload,
        ))),
        Err(e) => {
            tokio::fs::rename(&claimed, path).await?;
            Err(e)
        }
    }
}

/// Claimed messages handed to the subscription buffer, oldest first.
///
/// A file is deleted only after the consumer has taken its message; whatever is
/// left when the subscription goes away is renamed back into the pending set.
struct InFlight {
    taken: Arc<AtomicUsize>,
    confirmed: usize,
    queue: VecDeque<Claimed>,
}

impl InFlight {
    async fn confirm(&mut self) {
        let taken = self.taken.load(Ordering::SeqCst);
        while self.confirmed < taken {
            let Some(done) = self.queue.pop_front() else {
                break;
            };
            self.confirmed += 1;
            if let Err(e) = tokio::fs::remove_file(&done.claimed).await {
                warn!(path = %done.claimed.display(), error = %e, "Failed to remove delivered spool message");
            }
        }
    }

    async fn release(&mut self) {
        self.confirm().await;
        let returned = self.queue.len();
        for undelivered in self.queue.drain(..) {
            if let Err(e) = tokio::fs::rename(&undelivered.claimed, &undelivered.original).await {
                warn!(path = %undelivered.claimed.display(), error = %e, "Failed to return spool message");
            }
        }
        if returned > 0 {
            debug!(returned, "Returned undelivered spool messages");
        }
    }
}

async fn poll_loop(
    dir: PathBuf,
    tag: String,
    poll_interval: Duration,
    tx: mpsc::Sender<Vec<u8>>,
    mut in_flight: InFlight,
) {
    debug!(channel_dir = %dir.display(), "Spool subscriber started");
    'poll: while !tx.is_closed() {
        in_flight.confirm().await;
        match pending_messages(&dir).await {
            Ok(paths) => {
                for path in paths {
                    // Claim only once there is room to hand the message over.
                    let Ok(permit) = tx.reserve().await else {
                        break 'poll;
                    };
                    match claim(&path, &tag).await {
                        Ok(Some((claimed, payload))) => {
                            in_flight.queue.push_back(claimed);
                            permit.send(payload);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Failed to claim spool message");
                        }
                    }
                    in_flight.confirm().await;
                }
            }
            Err(e) => {
                warn!(channel_dir = %dir.display(), error = %e, "Failed to list spool channel");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = tx.closed() => break,
        }
    }
    in_flight.release().await;
    debug!(channel_dir = %dir.display(), "Spool subscriber stopped");
}

#[async_trait]
impl MessageBus for SpoolBus {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError> {
        let dir = self.channel_dir(channel)?;
        tokio::fs::create_dir_all(&dir).await?;

        let name = self.next_file_name();
        let tmp = dir.join(format!(".{}.tmp", name));
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, dir.join(&name)).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let dir = self.channel_dir(channel)?;
        tokio::fs::create_dir_all(&dir).await?;

        let (tx, rx) = mpsc::channel(SPOOL_PREFETCH);
        let subscription = Subscription::new(rx);
        let in_flight = InFlight {
            taken: subscription.taken_counter(),
            confirmed: 0,
            queue: VecDeque::new(),
        };
        let tag = format!(
            "claimed-{}-{}",
            std::process::id(),
            self.subscriptions.fetch_add(1, Ordering::SeqCst)
        );
        tokio::spawn(poll_loop(dir, tag, self.poll_interval, tx, in_flight));
        Ok(subscription)
    }
}
