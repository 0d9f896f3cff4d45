//! Message bus boundary.
//!
//! The aggregator only sees the [`Publisher`] trait. Two implementations
//! ship with the crate:
//!
//! - [`MqttPublisher`]: the production MQTT client
//! - [`MemoryPublisher`]: records publications in memory (tests, dry runs)

mod memory;
mod mqtt;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{MemoryPublisher, Publication};
pub use mqtt::{MqttPublisher, MqttSettings};

/// Delivery guarantee requested for a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl Delivery {
    /// Map an MQTT QoS level (0, 1 or 2).
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Delivery::AtMostOnce),
            1 => Some(Delivery::AtLeastOnce),
            2 => Some(Delivery::ExactlyOnce),
            _ => None,
        }
    }
}

/// Where and how aggregate updates are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub topic: String,
    pub delivery: Delivery,
    pub retain: bool,
}

impl PublishTarget {
    /// At-least-once, not retained.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            delivery: Delivery::default(),
            retain: false,
        }
    }
}

/// Errors returned by a publisher.
#[derive(Debug, Error)]
pub enum BusError {
    /// The client rejected or failed to hand over the message.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The client has been shut down.
    #[error("bus client closed")]
    Closed,
}

/// Publish side of a message bus client.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` to `topic`; resolves once the client accepted it.
    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        delivery: Delivery,
        retain: bool,
    ) -> Result<(), BusError>;
}
