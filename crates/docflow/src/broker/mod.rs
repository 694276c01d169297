//! Message broker seam.
//!
//! Producers and consumers only see the [`Broker`] trait: at-least-once
//! delivery with explicit ack/nack. [`MemoryBroker`] backs a single-process
//! deployment and the test suite.

mod memory;
pub mod message;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

pub use memory::MemoryBroker;
pub use message::{AggregationTrigger, MessageError, PageWork, PageWorkMessage};

/// Topics used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    PageWork,
    AggregationTrigger,
    DeadLetter,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::PageWork, Topic::AggregationTrigger, Topic::DeadLetter];

    pub fn name(self) -> &'static str {
        match self {
            Topic::PageWork => "page-processing-topic",
            Topic::AggregationTrigger => "aggregation-trigger-topic",
            Topic::DeadLetter => "dead-letter-topic",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A received message. Must be acked, nacked or dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: u64,
    pub topic: Topic,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

/// Envelope published to the dead-letter topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub source_topic: String,
    pub reason: String,
    /// Original payload, lossily decoded as UTF-8.
    pub payload: String,
    pub attempt: u32,
}

pub trait Broker: Send + Sync {
    /// Creates the given topics if they do not exist yet.
    fn ensure_topics(&self, topics: &[Topic]) -> Result<(), BrokerError>;

    fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Waits up to `timeout` for the next message. `Ok(None)` on timeout.
    fn receive(&self, topic: Topic, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Marks the delivery as processed.
    fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Returns the delivery to its topic for redelivery.
    fn nack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Whether the broker is reachable.
    fn is_healthy(&self) -> bool;

    /// Moves a rejected delivery to the dead-letter topic and acks it.
    fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        let envelope = DeadLetter {
            source_topic: delivery.topic.name().to_string(),
            reason: reason.to_string(),
            payload: String::from_utf8_lossy(&delivery.payload).into_owned(),
            attempt: delivery.attempt,
        };
        self.publish(Topic::DeadLetter, serde_json::to_vec(&envelope)?)?;
        log::warn!(
            "Dead-lettered delivery {} from {}: {}",
            delivery.id,
            delivery.topic,
            reason
        );
        self.ack(delivery)
    }
}

/// Serializes `message` as JSON and publishes it.
pub fn publish_json<M: Serialize>(
    broker: &dyn Broker,
    topic: Topic,
    message: &M,
) -> Result<(), BrokerError> {
    broker.publish(topic, serde_json::to_vec(message)?)
}
