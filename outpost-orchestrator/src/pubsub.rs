//! Change notifications.
//!
//! Delivery is at-least-once and unordered: a message only says "something
//! changed", subscribers re-read the store to learn what.

use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

/// Channel workers long-poll on for new pending jobs.
pub const JOB_POSTED_CHANNEL: &str = "provisioner_job_posted";

pub fn workspace_channel(workspace_id: &str) -> String {
    format!("workspace:{workspace_id}")
}

pub trait Pubsub: Send + Sync {
    fn publish(&self, channel: &str, message: &[u8]) -> Result<()>;
    fn subscribe(&self, channel: &str) -> Subscription;
}

pub struct Subscription {
    rx: broadcast::Receiver<Vec<u8>>,
}

impl Subscription {
    /// Waits for the next message. A subscriber that fell behind gets an empty
    /// message, which callers treat like any other "refetch" signal. `None`
    /// means the channel is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        match self.rx.recv().await {
            Ok(message) => Some(message),
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "subscriber lagged, coalescing notifications");
                Some(Vec::new())
            }
            Err(RecvError::Closed) => None,
        }
    }
}

/// In-process pub/sub backed by one broadcast channel per topic.
pub struct MemoryPubsub {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    capacity: usize,
}

impl MemoryPubsub {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }
}

impl Default for MemoryPubsub {
    fn default() -> Self {
        Self::new()
    }
}

impl Pubsub for MemoryPubsub {
    fn publish(&self, channel: &str, message: &[u8]) -> Result<()> {
        let mut channels = self.channels.lock();
        if let Some(tx) = channels.get(channel) {
            if tx.send(message.to_vec()).is_err() {
                // Every subscriber went away.
                channels.remove(channel);
            }
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Subscription {
        let mut channels = self.channels.lock();
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Subscription { rx: tx.subscribe() }
    }
}
