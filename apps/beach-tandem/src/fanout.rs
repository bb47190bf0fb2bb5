//! Per-room bus feeds.
//!
//! A node subscribes to a room topic while it holds at least one local member of the
//! room. Each feed runs one forwarding task that puts bus traffic through the room's
//! sequencer and hands the result to the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use transport_bus::{Bus, BusMessage, BusResult};

use crate::bus::{room_topic, RoomEnvelope};
use crate::metrics;
use crate::protocol::ServerEvent;
use crate::registry::{ConnectionRegistry, LocalConnection};
use crate::room::RoomId;
use crate::sequencer::Sequencer;

struct Feed {
    sequencer: Arc<SyncMutex<Sequencer>>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct RoomFeeds {
    bus: Arc<dyn Bus>,
    registry: Arc<ConnectionRegistry>,
    reorder_window: Duration,
    feeds: Arc<Mutex<HashMap<RoomId, Feed>>>,
}

impl RoomFeeds {
    pub fn new(bus: Arc<dyn Bus>, registry: Arc<ConnectionRegistry>, reorder_window: Duration) -> Self {
        Self {
            bus,
            registry,
            reorder_window,
            feeds: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Make sure the room feed is running, then start buffering for `connection`.
    /// Returns false when the connection was already a local member.
    pub async fn attach(&self, room: &str, connection: &str) -> BusResult<bool> {
        let mut feeds = self.feeds.lock().await;
        let running = feeds
            .get(room)
            .map(|feed| !feed.task.is_finished())
            .unwrap_or(false);
        if !running {
            let receiver = self.bus.subscribe(&room_topic(room)).await?;
            let sequencer = Arc::new(SyncMutex::new(Sequencer::new(room, self.reorder_window)));
            let task = tokio::spawn(forward(
                room.to_string(),
                receiver,
                Arc::clone(&sequencer),
                Arc::clone(&self.registry),
                self.clone(),
            ));
            info!(room = %room, "room feed started");
            feeds.insert(room.to_string(), Feed { sequencer, task });
        }
        Ok(self.registry.attach_pending(room, connection))
    }

    /// Anchor the room's sequencer at the revision of the snapshot a member joined with.
    pub async fn set_base(&self, room: &str, revision: u64) {
        let feeds = self.feeds.lock().await;
        if let Some(feed) = feeds.get(room) {
            let mut sequencer = feed.sequencer.lock();
            for envelope in sequencer.set_base(revision, Instant::now()) {
                self.registry.deliver(&envelope);
            }
        }
    }

    /// Detach `connection` and stop the feed once no local member is left.
    pub async fn detach(&self, room: &str, connection: &str) -> bool {
        let mut feeds = self.feeds.lock().await;
        let existed = self.registry.detach(room, connection);
        if !self.registry.has_local_members(room) {
            self.stop(&mut feeds, room).await;
        }
        existed
    }

    /// Detach every local member and stop the feed.
    pub async fn close(&self, room: &str) -> Vec<Arc<LocalConnection>> {
        let mut feeds = self.feeds.lock().await;
        let members = self.registry.detach_room(room);
        self.stop(&mut feeds, room).await;
        members
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.feeds.lock().await.keys().cloned().collect()
    }

    async fn stop(&self, feeds: &mut HashMap<RoomId, Feed>, room: &str) {
        let Some(feed) = feeds.remove(room) else {
            return;
        };
        feed.task.abort();
        // the receiver has to be gone before the bus will drop the topic
        let _ = feed.task.await;
        if let Err(err) = self.bus.unsubscribe(&room_topic(room)).await {
            warn!(room = %room, error = %err, "failed to unsubscribe room topic");
        }
        info!(room = %room, "room feed stopped");
    }

    async fn release_if_idle(&self, room: &str) {
        let mut feeds = self.feeds.lock().await;
        if !self.registry.has_local_members(room) {
            self.stop(&mut feeds, room).await;
        }
    }
}

async fn forward(
    room: RoomId,
    mut receiver: broadcast::Receiver<BusMessage>,
    sequencer: Arc<SyncMutex<Sequencer>>,
    registry: Arc<ConnectionRegistry>,
    feeds: RoomFeeds,
) {
    loop {
        let deadline = sequencer.lock().deadline();
        let received = match deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), receiver.recv())
                    .await
                {
                    Ok(received) => received,
                    Err(_) => {
                        let mut sequencer = sequencer.lock();
                        let (skipped, ready) = sequencer.expire(Instant::now());
                        if skipped > 0 {
                            metrics::reorder_gap(skipped);
                        }
                        for envelope in ready {
                            registry.deliver(&envelope);
                        }
                        continue;
                    }
                }
            }
            None => receiver.recv().await,
        };

        let message = match received {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(room = %room, skipped, "room feed lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let envelope = match RoomEnvelope::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(room = %room, error = %err, "dropping undecodable room message");
                continue;
            }
        };
        debug!(room = %room, revision = ?envelope.revision, "room message");
        let deleted = matches!(envelope.event, ServerEvent::Delete { .. });
        {
            let mut sequencer = sequencer.lock();
            for envelope in sequencer.push(envelope, Instant::now()) {
                registry.deliver(&envelope);
            }
        }
        if deleted {
            let members = registry.detach_room(&room);
            info!(room = %room, members = members.len(), "room deleted");
            // a recreated room counts its revisions from 1 again
            *sequencer.lock() = Sequencer::new(room.clone(), feeds.reorder_window);
            // stop() aborts this task, so it has to run on another one
            let feeds = feeds.clone();
            let room = room.clone();
            tokio::spawn(async move { feeds.release_if_idle(&room).await });
        }
    }
    warn!(room = %room, "room feed closed by the bus");
}
