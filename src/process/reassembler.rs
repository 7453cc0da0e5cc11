//! In-flight chunk buffers keyed by identity.

use crate::codec::{ChunkMessage, Reassembly, ReassemblyBuffer};
use crate::error::SorterError;
use crate::types::LogicalIdentity;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Result of accepting one chunk message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// Last missing chunk arrived; the buffer has been released.
    Complete {
        identity: LogicalIdentity,
        bytes: Vec<u8>,
    },
    Pending {
        identity: LogicalIdentity,
        received: usize,
        total: usize,
    },
}

struct Tracked {
    buffer: ReassemblyBuffer,
    last_activity: Instant,
}

/// Owns one [`ReassemblyBuffer`] per identity with chunks still outstanding.
///
/// Buffers whose last chunk arrived more than the stall timeout ago are evicted
/// by [`Reassembler::evict_stalled`].
pub struct Reassembler {
    buffers: Mutex<HashMap<LogicalIdentity, Tracked>>,
    stall_timeout: Duration,
}

impl Reassembler {
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            stall_timeout,
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        self.stall_timeout
    }

    /// Number of identities with a partially filled buffer.
    pub fn in_flight(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn accept(&self, message: &[u8]) -> Result<Accepted, SorterError> {
        self.accept_at(message, Instant::now())
    }

    /// Decode `message` and add it to its identity's buffer.
    ///
    /// Malformed messages and chunks whose count disagrees with the buffer are
    /// rejected without touching any buffer.
    pub fn accept_at(&self, message: &[u8], now: Instant) -> Result<Accepted, SorterError> {
        let chunk = ChunkMessage::decode(message)?;
        let mut buffers = self.buffers.lock();

        let tracked = buffers
            .entry(chunk.identity.clone())
            .or_insert_with(|| Tracked {
                buffer: ReassemblyBuffer::new(chunk.count),
                last_activity: now,
            });
        let outcome =
            tracked
                .buffer
                .insert(&chunk.identity, chunk.index, chunk.count, chunk.payload)?;
        tracked.last_activity = now;

        match outcome {
            Reassembly::Complete(bytes) => {
                buffers.remove(&chunk.identity);
                debug!(identity = %chunk.identity, size = bytes.len(), "Reassembled image");
                Ok(Accepted::Complete {
                    identity: chunk.identity,
                    bytes,
                })
            }
            Reassembly::Incomplete { received, total } => {
                debug!(
                    identity = %chunk.identity,
                    chunk = chunk.index,
                    received,
                    total,
                    "Buffered chunk"
                );
                Ok(Accepted::Pending {
                    identity: chunk.identity,
                    received,
                    total,
                })
            }
        }
    }

    /// Drop buffers idle for longer than the stall timeout.
    ///
    /// Returns one [`SorterError::StalledTransfer`] per evicted buffer.
    pub fn evict_stalled(&self, now: Instant) -> Vec<SorterError> {
        let mut buffers = self.buffers.lock();
        let stalled: Vec<LogicalIdentity> = buffers
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.last_activity) > self.stall_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = Vec::with_capacity(stalled.len());
        for identity in stalled {
            if let Some(tracked) = buffers.remove(&identity) {
                let idle = now.saturating_duration_since(tracked.last_activity);
                warn!(
                    identity = %identity,
                    received = tracked.buffer.received(),
                    total = tracked.buffer.total(),
                    idle_ms = idle.as_millis() as u64,
                    "Evicting stalled transfer"
                );
                evicted.push(SorterError::StalledTransfer {
                    identity,
                    received: tracked.buffer.received(),
                    total: tracked.buffer.total(),
                    idle_ms: idle.as_millis(),
                });
            }
        }
        evicted
    }
}
