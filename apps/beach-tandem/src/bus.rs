//! Room and control traffic on the cluster bus.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::RwLock;
use redis::aio::{ConnectionManager, PubSubSink};
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use transport_bus::{Bus, BusError, BusMessage, BusResult, TOPIC_CAPACITY};

use crate::protocol::ServerEvent;
use crate::room::ConnectionId;

pub const CONTROL_TOPIC: &str = "collab:bus:control";

pub fn room_topic(room: &str) -> String {
    format!("collab:bus:room:{}", room)
}

/// A room broadcast as it travels between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEnvelope {
    pub room: String,
    /// Connection that must not receive this event, usually the originator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<ConnectionId>,
    /// Room revision of the mutation behind the event. Events without one are not
    /// sequenced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    pub event: ServerEvent,
}

impl RoomEnvelope {
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    CollabEnabled { enabled: bool },
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

type Topics = Arc<RwLock<HashMap<String, broadcast::Sender<BusMessage>>>>;

/// Bus over Redis pub/sub. One subscriber connection is shared by every topic of the node.
pub struct RedisBus {
    publisher: ConnectionManager,
    sink: Mutex<PubSubSink>,
    topics: Topics,
    pump: JoinHandle<()>,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> BusResult<Self> {
        let client = Client::open(redis_url).map_err(transport)?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(transport)?;
        let (sink, mut stream) = client
            .get_async_pubsub()
            .await
            .map_err(transport)?
            .split();

        let topics: Topics = Arc::new(RwLock::new(HashMap::new()));
        let pump_topics = Arc::clone(&topics);
        let pump = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let topic = msg.get_channel_name().to_string();
                let sender = pump_topics.read().get(&topic).cloned();
                match sender {
                    Some(sender) => {
                        let _ = sender.send(BusMessage {
                            topic,
                            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
                        });
                    }
                    None => debug!(target = "collab.bus", %topic, "message for unwatched topic"),
                }
            }
            error!(target = "collab.bus", "redis pub/sub stream ended");
            // dropping the senders closes every receiver so feeds notice
            pump_topics.write().clear();
        });

        Ok(Self {
            publisher,
            sink: Mutex::new(sink),
            topics,
            pump,
        })
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn transport(err: redis::RedisError) -> BusError {
    BusError::Transport(err.to_string())
}

#[async_trait]
impl Bus for RedisBus {
    async fn subscribe(&self, topic: &str) -> BusResult<broadcast::Receiver<BusMessage>> {
        let (receiver, fresh) = {
            let mut guard = self.topics.write();
            match guard.get(topic) {
                Some(sender) => (sender.subscribe(), false),
                None => {
                    let (sender, receiver) = broadcast::channel(TOPIC_CAPACITY);
                    guard.insert(topic.to_string(), sender);
                    (receiver, true)
                }
            }
        };
        if fresh {
            if let Err(err) = self.sink.lock().await.subscribe(topic).await {
                self.topics.write().remove(topic);
                return Err(transport(err));
            }
        }
        Ok(receiver)
    }

    async fn unsubscribe(&self, topic: &str) -> BusResult<()> {
        let idle = {
            let mut guard = self.topics.write();
            let idle = guard
                .get(topic)
                .map(|sender| sender.receiver_count() == 0)
                .unwrap_or(false);
            if idle {
                guard.remove(topic);
            }
            idle
        };
        if idle {
            self.sink
                .lock()
                .await
                .unsubscribe(topic)
                .await
                .map_err(transport)?;
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let mut conn = self.publisher.clone();
        let _: i64 = conn
            .publish(topic, payload.as_ref())
            .await
            .map_err(transport)?;
        Ok(())
    }
}
