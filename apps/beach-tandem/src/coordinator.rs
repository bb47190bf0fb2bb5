//! The only component that mutates room state on behalf of clients.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use transport_bus::Bus;

use crate::access::{AccessControl, Principal};
use crate::bus::{room_topic, RoomEnvelope};
use crate::config::Config;
use crate::error::CollabError;
use crate::fanout::RoomFeeds;
use crate::metrics;
use crate::protocol::{Changes, ClientAction, ServerEvent};
use crate::registry::{ConnectionRegistry, LocalConnection};
use crate::retry::{retry_transient, RetryPolicy};
use crate::room::{color_preference, RoomKey, RoomMeta};
use crate::store::{Discarded, NewParticipant, RoomStateStore, StoreError};

pub struct RoomCoordinator {
    node: String,
    store: Arc<dyn RoomStateStore>,
    bus: Arc<dyn Bus>,
    registry: Arc<ConnectionRegistry>,
    feeds: RoomFeeds,
    access: Arc<dyn AccessControl>,
    enabled: watch::Receiver<bool>,
    echo_origin: bool,
    idle_ttl: Duration,
    retry: RetryPolicy,
}

impl RoomCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: impl Into<String>,
        config: &Config,
        store: Arc<dyn RoomStateStore>,
        bus: Arc<dyn Bus>,
        registry: Arc<ConnectionRegistry>,
        feeds: RoomFeeds,
        access: Arc<dyn AccessControl>,
        enabled: watch::Receiver<bool>,
    ) -> Self {
        Self {
            node: node.into(),
            store,
            bus,
            registry,
            feeds,
            access,
            enabled,
            echo_origin: config.echo_origin,
            idle_ttl: config.room_idle_ttl(),
            retry: RetryPolicy::new(config.order_retry_attempts),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn access(&self) -> &Arc<dyn AccessControl> {
        &self.access
    }

    /// Register a freshly accepted socket under a new cluster-wide id.
    pub fn connect(
        &self,
        principal: Principal,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) -> Arc<LocalConnection> {
        let id = Uuid::new_v4().to_string();
        info!(connection = %id, user = %principal.user, "connection opened");
        self.registry.register(id, principal, tx)
    }

    /// Implicit leave of every joined room, then forget the socket.
    pub async fn disconnect(&self, connection: &str) {
        let Some(local) = self.registry.get(connection) else {
            return;
        };
        for room in local.rooms() {
            if let Err(err) = self.leave_room(&local, &room).await {
                warn!(room = %room, connection = %connection, error = %err, "implicit leave failed");
            }
        }
        self.registry.unregister(connection);
        info!(connection = %connection, "connection closed");
    }

    /// Dispatch one client action. Replies addressed only to the caller are sent here;
    /// the returned error is for the caller to report.
    pub async fn handle(
        &self,
        connection: &Arc<LocalConnection>,
        action: ClientAction,
    ) -> Result<(), CollabError> {
        if let Some(room) = action.room() {
            if let Err(err) = connection.participation(room).transition(&action) {
                if self.store.room_meta(room).await?.is_none() {
                    return Err(CollabError::room_not_found(room));
                }
                return Err(err);
            }
        }

        match action {
            ClientAction::Join {
                collection,
                item,
                version,
                color,
                initial_changes,
            } => {
                let key = RoomKey::new(collection, item, version);
                let initial_changes = initial_changes.unwrap_or_default();
                self.join(connection, key, color.as_deref(), &initial_changes)
                    .await
                    .map(|_| ())
            }
            ClientAction::Leave { room: Some(room) } => self.leave_room(connection, &room).await,
            ClientAction::Leave { room: None } => {
                let mut failed = None;
                for room in connection.rooms() {
                    if let Err(err) = self.leave_room(connection, &room).await {
                        warn!(room = %room, connection = %connection.id, error = %err, "leave failed");
                        failed.get_or_insert(err);
                    }
                }
                failed.map_or(Ok(()), Err)
            }
            ClientAction::Focus { room, field } => {
                self.focus(&connection.id, &room, field.as_deref()).await
            }
            ClientAction::Update {
                room,
                field,
                changes: Some(value),
            } => self.update(&connection.id, &room, &field, value).await.map(|_| ()),
            ClientAction::Update {
                room,
                field,
                changes: None,
            } => self.unset(&connection.id, &room, &field).await,
            ClientAction::UpdateAll { room, changes } => self
                .update_all(&connection.id, &room, changes)
                .await
                .map(|_| ()),
            ClientAction::Discard { room, fields } => self
                .discard(&connection.id, &room, &fields)
                .await
                .map(|_| ()),
            ClientAction::Ping => {
                connection.send(ServerEvent::Pong);
                Ok(())
            }
        }
    }

    /// Join a room and send `init` to the caller. Returns the room id.
    pub async fn join(
        &self,
        connection: &Arc<LocalConnection>,
        key: RoomKey,
        color: Option<&str>,
        initial_changes: &Changes,
    ) -> Result<String, CollabError> {
        if !*self.enabled.borrow() {
            return Err(CollabError::ServiceUnavailable);
        }
        self.access.authorize(&connection.principal, &key).await?;

        let meta = RoomMeta::new(key);
        let room = meta.room.clone();
        let fresh = self.feeds.attach(&room, &connection.id).await?;

        let colors = color_preference(color);
        let joined = self
            .store
            .join_room(
                &meta,
                NewParticipant {
                    connection: &connection.id,
                    user: &connection.principal.user,
                    node: &self.node,
                    colors: &colors,
                },
                initial_changes,
            )
            .await;
        let joined = match joined {
            Ok(joined) => joined,
            Err(err) => {
                if fresh {
                    self.feeds.detach(&room, &connection.id).await;
                }
                return Err(err.into());
            }
        };

        let snapshot = match self.store.snapshot(&room).await {
            Ok(Some(snapshot)) => Ok(snapshot),
            Ok(None) => Err(CollabError::room_not_found(&room)),
            Err(err) => Err(err.into()),
        };
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(err) => {
                // a repeated join keeps the membership it already had
                if fresh {
                    self.feeds.detach(&room, &connection.id).await;
                }
                return Err(err);
            }
        };

        self.feeds.set_base(&room, snapshot.revision).await;
        let init = ServerEvent::Init {
            room: room.clone(),
            connection: connection.id.clone(),
            collection: snapshot.meta.key.collection.clone(),
            item: snapshot.meta.key.item.clone(),
            version: snapshot.meta.key.version.clone(),
            changes: snapshot.changes,
            focuses: snapshot.focuses,
            users: snapshot
                .participants
                .iter()
                .map(|participant| participant.user_info())
                .collect(),
        };
        self.registry
            .activate(&room, &connection.id, snapshot.revision, init);

        if joined.added {
            metrics::joined();
            info!(
                room = %room,
                connection = %connection.id,
                record = %meta.key.display_name(),
                created = joined.created,
                "joined room"
            );
            let event = ServerEvent::Join {
                room: room.clone(),
                connection: connection.id.clone(),
                user: joined.participant.user,
                color: joined.participant.color,
            };
            self.publish(&room, Some(&connection.id), Some(joined.revision), event)
                .await?;
        }
        Ok(room)
    }

    /// Focus `field`, or release focus with `None`. Repeating the current focus is silent.
    pub async fn focus(
        &self,
        connection: &str,
        room: &str,
        field: Option<&str>,
    ) -> Result<(), CollabError> {
        let outcome = self.store.set_focus(room, connection, field).await?;
        let Some(revision) = outcome.revision() else {
            return Ok(());
        };
        let event = ServerEvent::Focus {
            room: room.to_string(),
            connection: connection.to_string(),
            field: field.map(str::to_string),
        };
        self.publish(room, self.origin(connection), Some(revision), event)
            .await
    }

    /// Store a field value, taking focus of the field first. Returns the order it was given.
    pub async fn update(
        &self,
        connection: &str,
        room: &str,
        field: &str,
        value: Value,
    ) -> Result<u64, CollabError> {
        self.focus(connection, room, Some(field)).await?;
        self.apply(connection, room, field, value).await
    }

    /// Apply each field that nobody else is editing. Returns the orders given out.
    pub async fn update_all(
        &self,
        connection: &str,
        room: &str,
        changes: Changes,
    ) -> Result<Vec<u64>, CollabError> {
        let mut orders = Vec::with_capacity(changes.len());
        for (field, value) in changes {
            match self.apply(connection, room, &field, value).await {
                Ok(order) => orders.push(order),
                Err(CollabError::Conflict { field }) => {
                    debug!(room = %room, connection = %connection, field = %field, "skipping locked field");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(orders)
    }

    /// Remove a field from the dirty map on behalf of an `update` without a value.
    /// Refused while someone else has the field focused; focus itself is not taken.
    pub async fn unset(&self, connection: &str, room: &str, field: &str) -> Result<(), CollabError> {
        let discarded = self.store.unset(room, connection, field).await?;
        self.announce_discard(connection, room, discarded)
            .await
            .map(|_| ())
    }

    /// Returns the fields that were actually removed.
    pub async fn discard(
        &self,
        connection: &str,
        room: &str,
        fields: &[String],
    ) -> Result<Vec<String>, CollabError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let discarded = self.store.discard(room, connection, fields).await?;
        self.announce_discard(connection, room, discarded).await
    }

    async fn announce_discard(
        &self,
        connection: &str,
        room: &str,
        discarded: Discarded,
    ) -> Result<Vec<String>, CollabError> {
        if discarded.fields.is_empty() {
            return Ok(Vec::new());
        }
        let event = ServerEvent::Discard {
            room: room.to_string(),
            fields: discarded.fields.clone(),
        };
        self.publish(room, self.origin(connection), Some(discarded.revision), event)
            .await?;
        Ok(discarded.fields)
    }

    /// Leave one room. Leaving a room twice is harmless.
    pub async fn leave_room(&self, connection: &LocalConnection, room: &str) -> Result<(), CollabError> {
        self.feeds.detach(room, &connection.id).await;
        let departure = match self
            .store
            .remove_participant(room, &connection.id, self.idle_ttl)
            .await
        {
            Ok(departure) => departure,
            Err(StoreError::RoomNotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };
        let Some(departure) = departure else {
            return Ok(());
        };
        info!(
            room = %room,
            connection = %connection.id,
            remaining = departure.remaining,
            "left room"
        );
        let event = ServerEvent::Leave {
            room: room.to_string(),
            connection: connection.id.clone(),
        };
        self.publish(room, None, Some(departure.revision), event)
            .await
    }

    /// Drop participants whose node stopped heartbeating and announce their departure.
    /// Returns how many were removed.
    pub async fn sweep_dead_participants(&self) -> Result<usize, CollabError> {
        let mut removed = 0;
        for meta in self.store.rooms().await? {
            let participants = self.store.participants(&meta.room).await?;
            let mut nodes: Vec<String> = participants
                .iter()
                .map(|participant| participant.node.clone())
                .filter(|node| node != &self.node)
                .collect();
            nodes.sort();
            nodes.dedup();
            let live = self.store.live_nodes(&nodes).await?;
            for participant in participants {
                if participant.node == self.node || live.contains(&participant.node) {
                    continue;
                }
                let Some(departure) = self
                    .store
                    .remove_participant(&meta.room, &participant.connection, self.idle_ttl)
                    .await?
                else {
                    continue;
                };
                warn!(
                    room = %meta.room,
                    connection = %participant.connection,
                    node = %participant.node,
                    "removed participant of dead node"
                );
                removed += 1;
                let event = ServerEvent::Leave {
                    room: meta.room.clone(),
                    connection: participant.connection,
                };
                self.publish(&meta.room, None, Some(departure.revision), event)
                    .await?;
            }
        }
        Ok(removed)
    }

    async fn apply(
        &self,
        connection: &str,
        room: &str,
        field: &str,
        value: Value,
    ) -> Result<u64, CollabError> {
        let store = &self.store;
        let value_ref = &value;
        let applied = retry_transient(self.retry, "allocate order", move || {
            store.apply_update(room, connection, field, value_ref)
        })
        .await?;
        metrics::update_applied();
        debug!(
            room = %room,
            connection = %connection,
            field = %field,
            order = applied.order,
            "update applied"
        );

        let event = ServerEvent::Update {
            room: room.to_string(),
            connection: connection.to_string(),
            field: field.to_string(),
            changes: value,
            order: applied.order,
        };
        self.publish(room, self.origin(connection), Some(applied.revision), event)
            .await?;
        Ok(applied.order)
    }

    fn origin<'a>(&self, connection: &'a str) -> Option<&'a str> {
        if self.echo_origin {
            None
        } else {
            Some(connection)
        }
    }

    pub(crate) async fn publish(
        &self,
        room: &str,
        exclude: Option<&str>,
        revision: Option<u64>,
        event: ServerEvent,
    ) -> Result<(), CollabError> {
        let envelope = RoomEnvelope {
            room: room.to_string(),
            exclude: exclude.map(str::to_string),
            revision,
            event,
        };
        let payload = envelope
            .encode()
            .map_err(|err| CollabError::TransientStore(err.to_string()))?;
        let topic = room_topic(room);
        let bus = &self.bus;
        let topic = topic.as_str();
        retry_transient(self.retry, "publish", move || bus.publish(topic, payload.clone())).await?;
        Ok(())
    }

    pub(crate) fn store(&self) -> &Arc<dyn RoomStateStore> {
        &self.store
    }

    pub(crate) fn feeds(&self) -> &RoomFeeds {
        &self.feeds
    }
}
