//! Message Bus
//!
//! Publish/subscribe seam between the ingestion and processing pipelines. The two
//! sides share nothing else in-process.
//!
//! - [`MemoryBus`]: in-process fan-out to every subscriber
//! - [`SpoolBus`]: cross-process spool directory with competing consumers

pub mod memory;
pub mod spool;

use crate::error::{BusError, SorterError};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

pub use memory::MemoryBus;
pub use spool::SpoolBus;

/// Stream of raw message payloads for one channel.
///
/// Counts the messages the consumer has taken, so a transport can tell them
/// apart from messages still waiting in the buffer when the subscription is
/// dropped.
pub struct Subscription {
    rx: mpsc::Receiver<Vec<u8>>,
    taken: Arc<AtomicUsize>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            taken: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared count of messages returned by `recv`/`try_recv` so far.
    pub(crate) fn taken_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.taken)
    }

    /// Next message, or `None` once the transport side has gone away.
    ///
    /// Cancel safe: a message is only counted once it has been returned.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        let message = self.rx.recv().await;
        if message.is_some() {
            self.taken.fetch_add(1, Ordering::SeqCst);
        }
        message
    }

    pub fn try_recv(&mut self) -> Result<Vec<u8>, TryRecvError> {
        let message = self.rx.try_recv()?;
        self.taken.fetch_add(1, Ordering::SeqCst);
        Ok(message)
    }
}

/// Buffered messages per in-process subscriber before delivery waits on the
/// consumer.
pub const SUBSCRIPTION_CAPACITY: usize = 1024;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish one message on `channel`.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError>;

    /// Start receiving messages published on `channel`.
    ///
    /// Dropping the returned receiver ends the subscription.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError>;
}

/// Channel names are `[A-Za-z0-9._-]+`; they become directory names on the spool.
pub fn validate_channel(channel: &str) -> Result<(), BusError> {
    let valid = !channel.is_empty()
        && channel != "."
        && channel != ".."
        && channel
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(BusError::InvalidChannel(channel.to_string()))
    }
}

/// Publish with bounded retries; exhaustion surfaces as
/// [`SorterError::PublishFailure`].
pub async fn publish_with_retry(
    bus: &dyn MessageBus,
    retry: &RetryPolicy,
    channel: &str,
    payload: &[u8],
) -> Result<(), SorterError> {
    retry
        .run_async("bus_publish", BusError::is_transient, || {
            bus.publish(channel, payload)
        })
        .await
        .map_err(|exhausted| SorterError::PublishFailure {
            attempts: exhausted.attempts,
            source: exhausted.last_error,
        })
}
