//! Topic-partitioned publish/subscribe used to carry room traffic between nodes.
//!
//! A topic is the unit of ordering: messages published to one topic reach every
//! subscriber of that topic in publish order. Nothing is promised across topics.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of each per-topic fan-out channel.
pub const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

impl BusError {
    /// Transport failures may succeed on retry; a closed bus never will.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Transport(_))
    }
}

pub type BusResult<T> = Result<T, BusError>;

#[async_trait]
pub trait Bus: Send + Sync {
    /// Start receiving messages for `topic`. Every call returns an independent receiver.
    async fn subscribe(&self, topic: &str) -> BusResult<broadcast::Receiver<BusMessage>>;

    /// Drop interest in `topic` once no local receivers remain.
    async fn unsubscribe(&self, topic: &str) -> BusResult<()>;

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}

/// In-process bus. Sharing one instance between several nodes simulates a cluster.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Number of live receivers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn subscribe(&self, topic: &str) -> BusResult<broadcast::Receiver<BusMessage>> {
        Ok(self.sender_for(topic).subscribe())
    }

    async fn unsubscribe(&self, topic: &str) -> BusResult<()> {
        let mut guard = self.topics.write();
        if guard
            .get(topic)
            .map(|sender| sender.receiver_count() == 0)
            .unwrap_or(false)
        {
            guard.remove(topic);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.topics.read().get(topic).cloned();
        if let Some(sender) = sender {
            // A topic nobody listens to is not an error; the message is simply not observed.
            let _ = sender.send(BusMessage {
                topic: topic.to_string(),
                payload,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("collab:room:abc").await.expect("subscribe ok");
        bus.publish("collab:room:abc", Bytes::from_static(b"ping"))
            .await
            .expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "collab:room:abc");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn every_subscriber_sees_publish_order() {
        let bus = LocalBus::new();
        let mut first = bus.subscribe("room").await.unwrap();
        let mut second = bus.subscribe("room").await.unwrap();
        for n in 0..5u8 {
            bus.publish("room", Bytes::from(vec![n])).await.unwrap();
        }
        for sub in [&mut first, &mut second] {
            for n in 0..5u8 {
                assert_eq!(sub.recv().await.unwrap().payload, Bytes::from(vec![n]));
            }
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn topics_are_isolated() {
        let bus = LocalBus::new();
        let mut room_a = bus.subscribe("a").await.unwrap();
        bus.publish("b", Bytes::from_static(b"x")).await.unwrap();
        bus.publish("a", Bytes::from_static(b"y")).await.unwrap();
        assert_eq!(room_a.recv().await.unwrap().payload, Bytes::from_static(b"y"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn unsubscribe_drops_idle_topic() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("a").await.unwrap();
        bus.unsubscribe("a").await.unwrap();
        assert_eq!(bus.subscriber_count("a"), 1);
        drop(sub);
        bus.unsubscribe("a").await.unwrap();
        assert_eq!(bus.subscriber_count("a"), 0);
    }
}
