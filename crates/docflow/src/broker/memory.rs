use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use super::{Broker, DeadLetter, Delivery, Topic};
use crate::error::BrokerError;

struct TopicQueue {
    sender: Sender<Delivery>,
    receiver: Receiver<Delivery>,
}

/// In-process broker built on unbounded crossbeam channels.
///
/// Unacked deliveries are tracked until acked or nacked; a nack puts the
/// message back at the tail of its topic with the attempt counter bumped.
pub struct MemoryBroker {
    topics: RwLock<HashMap<Topic, TopicQueue>>,
    in_flight: Mutex<HashMap<u64, Delivery>>,
    next_id: AtomicU64,
    available: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A broker with no topics. Call [`Broker::ensure_topics`] before use.
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// A broker with every pipeline topic already created.
    pub fn with_default_topics() -> Self {
        let broker = Self::new();
        if let Ok(mut topics) = broker.topics.write() {
            for topic in Topic::ALL {
                topics.insert(topic, new_queue());
            }
        }
        broker
    }

    /// Simulates an outage: while unavailable, publish and receive fail
    /// with [`BrokerError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Messages waiting on a topic (excluding in-flight ones).
    pub fn pending(&self, topic: Topic) -> usize {
        self.topics
            .read()
            .ok()
            .and_then(|topics| topics.get(&topic).map(|q| q.receiver.len()))
            .unwrap_or(0)
    }

    /// Deliveries received but not yet acked or nacked.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Removes and returns every dead-lettered envelope.
    pub fn drain_dead_letters(&self) -> Vec<DeadLetter> {
        let receiver = match self.receiver(Topic::DeadLetter) {
            Ok(receiver) => receiver,
            Err(_) => return Vec::new(),
        };
        receiver
            .try_iter()
            .filter_map(|d| serde_json::from_slice(&d.payload).ok())
            .collect()
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("broker marked unavailable".to_string()))
        }
    }

    fn sender(&self, topic: Topic) -> Result<Sender<Delivery>, BrokerError> {
        let topics = self
            .topics
            .read()
            .map_err(|_| BrokerError::Unavailable("topic registry poisoned".to_string()))?;
        topics
            .get(&topic)
            .map(|q| q.sender.clone())
            .ok_or_else(|| BrokerError::UnknownTopic(topic.name().to_string()))
    }

    fn receiver(&self, topic: Topic) -> Result<Receiver<Delivery>, BrokerError> {
        let topics = self
            .topics
            .read()
            .map_err(|_| BrokerError::Unavailable("topic registry poisoned".to_string()))?;
        topics
            .get(&topic)
            .map(|q| q.receiver.clone())
            .ok_or_else(|| BrokerError::UnknownTopic(topic.name().to_string()))
    }

    fn take_in_flight(&self, id: u64) -> Result<Option<Delivery>, BrokerError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| BrokerError::Unavailable("in-flight table poisoned".to_string()))?;
        Ok(in_flight.remove(&id))
    }
}

fn new_queue() -> TopicQueue {
    let (sender, receiver) = unbounded();
    TopicQueue { sender, receiver }
}

impl Broker for MemoryBroker {
    fn ensure_topics(&self, topics: &[Topic]) -> Result<(), BrokerError> {
        let mut registry = self
            .topics
            .write()
            .map_err(|_| BrokerError::Unavailable("topic registry poisoned".to_string()))?;
        for topic in topics {
            if !registry.contains_key(topic) {
                log::info!("Creating topic {}", topic);
                registry.insert(*topic, new_queue());
            }
        }
        Ok(())
    }

    fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.check_available()?;
        let delivery = Delivery {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            topic,
            payload,
            attempt: 1,
        };
        self.sender(topic)?
            .send(delivery)
            .map_err(|_| BrokerError::ChannelClosed(topic.name().to_string()))
    }

    fn receive(&self, topic: Topic, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.check_available()?;
        let receiver = self.receiver(topic)?;
        match receiver.recv_timeout(timeout) {
            Ok(delivery) => {
                let mut in_flight = self
                    .in_flight
                    .lock()
                    .map_err(|_| BrokerError::Unavailable("in-flight table poisoned".to_string()))?;
                in_flight.insert(delivery.id, delivery.clone());
                Ok(Some(delivery))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(BrokerError::ChannelClosed(topic.name().to_string()))
            }
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        if self.take_in_flight(delivery.id)?.is_none() {
            log::debug!("Ack for unknown delivery {}", delivery.id);
        }
        Ok(())
    }

    fn nack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let Some(mut original) = self.take_in_flight(delivery.id)? else {
            log::debug!("Nack for unknown delivery {}", delivery.id);
            return Ok(());
        };
        original.attempt += 1;
        let topic = original.topic;
        self.sender(topic)?
            .send(original)
            .map_err(|_| BrokerError::ChannelClosed(topic.name().to_string()))
    }

    fn is_healthy(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[test]
    fn test_publish_requires_topic() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.publish(Topic::PageWork, b"x".to_vec()),
            Err(BrokerError::UnknownTopic(_))
        ));

        broker.ensure_topics(&[Topic::PageWork]).unwrap();
        broker.publish(Topic::PageWork, b"x".to_vec()).unwrap();
        assert_eq!(broker.pending(Topic::PageWork), 1);
    }

    #[test]
    fn test_ensure_topics_is_idempotent() {
        let broker = MemoryBroker::new();
        broker.ensure_topics(&Topic::ALL).unwrap();
        broker.publish(Topic::PageWork, b"x".to_vec()).unwrap();
        broker.ensure_topics(&Topic::ALL).unwrap();
        assert_eq!(broker.pending(Topic::PageWork), 1);
    }

    #[test]
    fn test_receive_ack() {
        let broker = MemoryBroker::with_default_topics();
        broker.publish(Topic::PageWork, b"a".to_vec()).unwrap();

        let delivery = broker.receive(Topic::PageWork, WAIT).unwrap().unwrap();
        assert_eq!(delivery.payload, b"a");
        assert_eq!(delivery.attempt, 1);
        assert_eq!(broker.in_flight(), 1);

        broker.ack(&delivery).unwrap();
        assert_eq!(broker.in_flight(), 0);
        assert!(broker.receive(Topic::PageWork, WAIT).unwrap().is_none());
    }

    #[test]
    fn test_nack_redelivers_with_bumped_attempt() {
        let broker = MemoryBroker::with_default_topics();
        broker
            .publish(Topic::AggregationTrigger, b"t".to_vec())
            .unwrap();

        let first = broker
            .receive(Topic::AggregationTrigger, WAIT)
            .unwrap()
            .unwrap();
        broker.nack(&first).unwrap();

        let second = broker
            .receive(Topic::AggregationTrigger, WAIT)
            .unwrap()
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);
    }

    #[test]
    fn test_dead_letter_keeps_reason() {
        let broker = MemoryBroker::with_default_topics();
        broker.publish(Topic::PageWork, b"garbage".to_vec()).unwrap();
        let delivery = broker.receive(Topic::PageWork, WAIT).unwrap().unwrap();

        broker.dead_letter(&delivery, "malformed").unwrap();

        assert_eq!(broker.in_flight(), 0);
        let letters = broker.drain_dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, "malformed");
        assert_eq!(letters[0].payload, "garbage");
        assert_eq!(letters[0].source_topic, "page-processing-topic");
    }

    #[test]
    fn test_unavailable_broker_fails_publish() {
        let broker = MemoryBroker::with_default_topics();
        broker.set_available(false);
        assert!(!broker.is_healthy());
        assert!(matches!(
            broker.publish(Topic::PageWork, b"x".to_vec()),
            Err(BrokerError::Unavailable(_))
        ));
        broker.set_available(true);
        assert!(broker.publish(Topic::PageWork, b"x".to_vec()).is_ok());
    }
}
