//! Live log transport over a publish/subscribe bus

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::errors::PlatformError;
use crate::models::log_event::LogEvent;
use crate::transport::emitter::LogSink;
use crate::transport::topics::{topic_matches, Topics};

/// A message as seen by bus subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Best-effort publish/subscribe bus
#[async_trait]
pub trait PubSubBus: Send + Sync {
    /// Publish to a channel. Nothing is retained for later subscribers.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PlatformError>;

    /// Subscribe to every channel matching `pattern` from now on
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, PlatformError>;

    /// Flush outstanding publishes and disconnect
    async fn close(&self) -> Result<(), PlatformError> {
        Ok(())
    }
}

/// A pattern subscription.
///
/// Each subscription owns its own bounded queue; a subscriber that falls
/// behind loses the oldest messages instead of slowing the publisher.
pub struct Subscription {
    pattern: String,
    rx: broadcast::Receiver<BusMessage>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(pattern: impl Into<String>, rx: broadcast::Receiver<BusMessage>) -> Self {
        Self {
            pattern: pattern.into(),
            rx,
            on_drop: None,
        }
    }

    /// Run `release` once the subscriber goes away
    pub fn with_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.on_drop = Some(Box::new(release));
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next matching message, `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) if topic_matches(&self.pattern, &message.channel) => return Some(message),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber on {} lagged, dropped {} messages", self.pattern, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.on_drop.take() {
            release();
        }
    }
}

/// In-process bus backed by a broadcast channel
pub struct MemoryBus {
    tx: broadcast::Sender<BusMessage>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl PubSubBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PlatformError> {
        // No receivers is not an error: live delivery is at-most-once
        let _ = self.tx.send(BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, PlatformError> {
        Ok(Subscription::new(pattern, self.tx.subscribe()))
    }
}

/// Producer side of the live transport
pub struct LiveSink {
    bus: Arc<dyn PubSubBus>,
}

impl LiveSink {
    pub fn new(bus: Arc<dyn PubSubBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl LogSink for LiveSink {
    async fn append(&self, event: &LogEvent) -> Result<(), PlatformError> {
        let channel = Topics::deployment_logs(&event.project_id, &event.deployment_id);
        let payload = serde_json::to_string(event)?;
        self.bus
            .publish(&channel, &payload)
            .await
            .map_err(|e| PlatformError::TransportError(e.to_string()))
    }

    async fn close(&self) -> Result<(), PlatformError> {
        self.bus.close().await
    }
}
