//! In-process bus. Every subscriber of a channel receives every message.
//!
//! Also keeps a log of published payloads per channel so callers can inspect what
//! went out, and can be told to fail the next N publishes.

use super::{validate_channel, MessageBus, Subscription, SUBSCRIPTION_CAPACITY};
use crate::error::BusError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

#[derive(Default)]
pub struct MemoryBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
    published: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    failures_pending: AtomicUsize,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail with [`BusError::Unreachable`].
    pub fn fail_next_publishes(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Everything successfully published on `channel`, in publish order.
    pub fn published(&self, channel: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    fn take_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError> {
        validate_channel(channel)?;
        if self.take_failure() {
            return Err(BusError::Unreachable("injected publish failure".to_string()));
        }

        self.published
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(payload.to_vec());

        let senders = self
            .subscribers
            .lock()
            .get(channel)
            .cloned()
            .unwrap_or_default();
        for sender in &senders {
            // A dropped receiver just means that subscriber went away.
            let _ = sender.send(payload.to_vec()).await;
        }

        if senders.iter().any(|s| s.is_closed()) {
            if let Some(list) = self.subscribers.lock().get_mut(channel) {
                list.retain(|s| !s.is_closed());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        validate_channel(channel)?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.subscribers
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("load").await.unwrap();
        let mut b = bus.subscribe("load").await.unwrap();
        let mut other = bus.subscribe("other").await.unwrap();

        bus.publish("load", b"m1").await.unwrap();

        assert_eq!(a.recv().await.unwrap(), b"m1".to_vec());
        assert_eq!(b.recv().await.unwrap(), b"m1".to_vec());
        assert!(other.try_recv().is_err());
        assert_eq!(bus.published("load"), vec![b"m1".to_vec()]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let bus = MemoryBus::new();
        bus.fail_next_publishes(2);
        assert!(bus.publish("load", b"x").await.is_err());
        assert!(bus.publish("load", b"x").await.is_err());
        assert!(bus.publish("load", b"x").await.is_ok());
        assert_eq!(bus.published("load").len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = MemoryBus::new();
        let rx = bus.subscribe("load").await.unwrap();
        drop(rx);
        bus.publish("load", b"x").await.unwrap();
        assert!(bus.subscribers.lock().get("load").unwrap().is_empty());
    }
}
