//! Turns record saves, record deletions and the feature flag into room traffic.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use transport_bus::Bus;

use crate::arbiter::LeaderArbitrator;
use crate::bus::{ControlMessage, CONTROL_TOPIC};
use crate::coordinator::RoomCoordinator;
use crate::error::CollabError;
use crate::protocol::{Changes, ServerEvent};
use crate::room::RoomId;

pub struct ExternalEventBridge {
    coordinator: Arc<RoomCoordinator>,
    arbiter: LeaderArbitrator,
    bus: Arc<dyn Bus>,
    enabled: watch::Sender<bool>,
}

impl ExternalEventBridge {
    pub fn new(
        coordinator: Arc<RoomCoordinator>,
        arbiter: LeaderArbitrator,
        bus: Arc<dyn Bus>,
        enabled: watch::Sender<bool>,
    ) -> Self {
        Self {
            coordinator,
            arbiter,
            bus,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    /// A record was written outside the collab session. Returns the rooms this node
    /// announced the save to.
    pub async fn on_item_saved(
        &self,
        collection: &str,
        item: Option<&str>,
        version: Option<&str>,
        timestamp: &str,
        fields: Option<&Changes>,
    ) -> Result<Vec<RoomId>, CollabError> {
        let store = self.coordinator.store();
        let rooms = store.rooms_for_item(collection, item).await?;
        let fingerprint = LeaderArbitrator::fingerprint(&[
            "save",
            collection,
            item.unwrap_or_default(),
            version.unwrap_or_default(),
            timestamp,
        ]);

        let mut announced = Vec::new();
        for meta in rooms {
            if !meta.key.matches_save(collection, item, version) {
                continue;
            }
            if !self.arbiter.claim(&meta.room, &fingerprint).await {
                continue;
            }
            let saved = fields.cloned().unwrap_or_default();
            let revision = match store.prune_saved(&meta.room, &saved).await {
                Ok(Some(pruned)) => {
                    if !pruned.fields.is_empty() {
                        info!(room = %meta.room, cleared = pruned.fields.len(), "pruned saved fields");
                    }
                    Some(pruned.revision)
                }
                Ok(None) => None,
                Err(err) => {
                    warn!(room = %meta.room, error = %err, "failed to prune saved fields");
                    None
                }
            };
            let event = ServerEvent::Save {
                room: meta.room.clone(),
            };
            self.coordinator
                .publish(&meta.room, None, revision, event)
                .await?;
            announced.push(meta.room);
        }
        Ok(announced)
    }

    /// A record was deleted. Every room on it is announced and closed.
    pub async fn on_item_deleted(
        &self,
        collection: &str,
        item: Option<&str>,
        timestamp: Option<&str>,
    ) -> Result<Vec<RoomId>, CollabError> {
        let store = self.coordinator.store();
        let rooms = store.rooms_for_item(collection, item).await?;
        let fingerprint = LeaderArbitrator::fingerprint(&[
            "delete",
            collection,
            item.unwrap_or_default(),
            timestamp.unwrap_or_default(),
        ]);

        let mut announced = Vec::new();
        for meta in rooms {
            if !meta.key.matches_delete(collection, item) {
                continue;
            }
            if !self.arbiter.claim(&meta.room, &fingerprint).await {
                continue;
            }
            let event = ServerEvent::Delete {
                room: meta.room.clone(),
            };
            self.coordinator
                .publish(&meta.room, None, None, event)
                .await?;
            store.close_room(&meta.room).await?;
            info!(room = %meta.room, record = %meta.key.display_name(), "room closed by deletion");
            announced.push(meta.room);
        }
        Ok(announced)
    }

    /// Persist the flag and tell every node about it. Disabling also terminates rooms
    /// that no node is holding open, so their dirty state is gone when editing resumes.
    pub async fn set_enabled(&self, enabled: bool) -> Result<(), CollabError> {
        let store = self.coordinator.store();
        store.set_collab_enabled(enabled).await?;
        let payload = ControlMessage::CollabEnabled { enabled }
            .encode()
            .map_err(|err| CollabError::TransientStore(err.to_string()))?;
        self.bus.publish(CONTROL_TOPIC, payload).await?;
        self.apply_flag(enabled).await;
        if enabled {
            return Ok(());
        }

        let mut closed = 0;
        for meta in store.rooms().await? {
            if store.close_room(&meta.room).await? {
                closed += 1;
            }
        }
        info!(rooms = closed, "terminated remaining rooms after disable");
        Ok(())
    }

    /// Re-read the persisted flag, for when control messages may have been missed.
    pub async fn refresh_flag(&self) {
        match self.coordinator.store().collab_enabled().await {
            Ok(enabled) => self.apply_flag(enabled.unwrap_or(true)).await,
            Err(err) => warn!(error = %err, "failed to read collaborative editing flag"),
        }
    }

    /// Apply a flag value seen on the control topic. Disabling closes every local room.
    pub async fn apply_flag(&self, enabled: bool) {
        let changed = self.enabled.send_if_modified(|current| {
            let changed = *current != enabled;
            *current = enabled;
            changed
        });
        if !changed {
            return;
        }
        info!(enabled, "collaborative editing flag changed");
        if enabled {
            return;
        }

        let feeds = self.coordinator.feeds();
        for room in feeds.active_rooms().await {
            let members = feeds.close(&room).await;
            for member in &members {
                member.send(ServerEvent::service_unavailable(Some(&room)));
            }
            if let Err(err) = self.coordinator.store().close_room(&room).await {
                warn!(room = %room, error = %err, "failed to close room after disable");
            }
            info!(room = %room, members = members.len(), "room closed by disable");
        }
    }
}
