use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::access::Principal;
use crate::bus::RoomEnvelope;
use crate::protocol::ServerEvent;
use crate::room::{ConnectionId, RoomId};
use crate::session::Participation;

/// A room event and the store revision behind it.
type Revisioned = (Option<u64>, ServerEvent);

#[derive(Debug)]
enum Membership {
    /// Join in progress: room traffic is held until `init` has been sent.
    Pending(Vec<Revisioned>),
    /// Events at or below `base` were already part of the `init` snapshot.
    Joined { base: u64 },
}

fn covered(revision: Option<u64>, base: u64) -> bool {
    revision.map(|revision| revision <= base).unwrap_or(false)
}

/// A socket held by this node.
#[derive(Debug)]
pub struct LocalConnection {
    pub id: ConnectionId,
    pub principal: Principal,
    tx: mpsc::UnboundedSender<ServerEvent>,
    memberships: Mutex<HashMap<RoomId, Membership>>,
}

impl LocalConnection {
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn participation(&self, room: &str) -> Participation {
        if self.memberships.lock().contains_key(room) {
            Participation::Joined
        } else {
            Participation::Unjoined
        }
    }

    pub fn rooms(&self) -> Vec<RoomId> {
        self.memberships.lock().keys().cloned().collect()
    }

    fn deliver(&self, envelope: &RoomEnvelope) {
        let mut memberships = self.memberships.lock();
        match memberships.get_mut(&envelope.room) {
            Some(Membership::Pending(buffer)) => {
                buffer.push((envelope.revision, envelope.event.clone()))
            }
            Some(Membership::Joined { base }) => {
                if covered(envelope.revision, *base) {
                    return;
                }
                let _ = self.tx.send(envelope.event.clone());
            }
            None => {}
        }
    }
}

/// Local index used only for fan-out. Cluster-wide presence lives in the store.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Map of connection_id -> connection
    connections: DashMap<ConnectionId, Arc<LocalConnection>>,
    /// Map of room -> local connections in it
    rooms: DashMap<RoomId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        id: ConnectionId,
        principal: Principal,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) -> Arc<LocalConnection> {
        let connection = Arc::new(LocalConnection {
            id: id.clone(),
            principal,
            tx,
            memberships: Mutex::new(HashMap::new()),
        });
        self.connections.insert(id, Arc::clone(&connection));
        connection
    }

    /// Forget the connection. Its room memberships must be detached separately.
    pub fn unregister(&self, id: &str) -> Option<Arc<LocalConnection>> {
        self.connections.remove(id).map(|(_, connection)| connection)
    }

    pub fn get(&self, id: &str) -> Option<Arc<LocalConnection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Start buffering room traffic for a joining connection.
    /// Returns false when the connection was already a member.
    pub fn attach_pending(&self, room: &str, connection: &str) -> bool {
        let Some(local) = self.get(connection) else {
            return false;
        };
        let fresh = {
            let mut memberships = local.memberships.lock();
            if memberships.contains_key(room) {
                false
            } else {
                memberships.insert(room.to_string(), Membership::Pending(Vec::new()));
                true
            }
        };
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection.to_string());
        fresh
    }

    /// Send `init` and then whatever arrived while the join was in flight and is newer
    /// than the snapshot at `base`.
    pub fn activate(&self, room: &str, connection: &str, base: u64, init: ServerEvent) {
        let Some(local) = self.get(connection) else {
            return;
        };
        let mut memberships = local.memberships.lock();
        let buffered = match memberships.insert(room.to_string(), Membership::Joined { base }) {
            Some(Membership::Pending(buffer)) => buffer,
            _ => Vec::new(),
        };
        let _ = local.tx.send(init);
        for (revision, event) in buffered {
            if covered(revision, base) {
                continue;
            }
            let _ = local.tx.send(event);
        }
    }

    /// Remove the membership. Returns whether it existed.
    pub fn detach(&self, room: &str, connection: &str) -> bool {
        let existed = self
            .get(connection)
            .map(|local| local.memberships.lock().remove(room).is_some())
            .unwrap_or(false);
        let emptied = match self.rooms.get_mut(room) {
            Some(mut members) => {
                members.remove(connection);
                members.is_empty()
            }
            None => false,
        };
        if emptied {
            self.rooms.remove_if(room, |_, members| members.is_empty());
        }
        existed
    }

    /// Detach every local member of `room`, returning them.
    pub fn detach_room(&self, room: &str) -> Vec<Arc<LocalConnection>> {
        let members = self
            .rooms
            .remove(room)
            .map(|(_, members)| members)
            .unwrap_or_default();
        members
            .into_iter()
            .filter_map(|id| self.get(&id))
            .inspect(|local| {
                local.memberships.lock().remove(room);
            })
            .collect()
    }

    pub fn has_local_members(&self, room: &str) -> bool {
        self.rooms
            .get(room)
            .map(|members| !members.is_empty())
            .unwrap_or(false)
    }

    pub fn local_members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn local_rooms(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Fan a room broadcast out to local members.
    pub fn deliver(&self, envelope: &RoomEnvelope) {
        let members = self.local_members(&envelope.room);
        for id in members {
            if envelope.exclude.as_deref() == Some(id.as_str()) {
                continue;
            }
            match self.get(&id) {
                Some(local) => local.deliver(envelope),
                None => debug!(room = %envelope.room, connection = %id, "member without socket"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(order: u64) -> ServerEvent {
        ServerEvent::Update {
            room: "r".into(),
            connection: "other".into(),
            field: "f".into(),
            changes: json!(order),
            order,
        }
    }

    /// Updates in these tests take their order as their revision.
    fn envelope(event: ServerEvent, exclude: Option<&str>) -> RoomEnvelope {
        RoomEnvelope {
            room: "r".into(),
            exclude: exclude.map(str::to_string),
            revision: event.order(),
            event,
        }
    }

    fn init() -> ServerEvent {
        ServerEvent::Init {
            room: "r".into(),
            connection: "c1".into(),
            collection: "articles".into(),
            item: None,
            version: None,
            changes: Default::default(),
            focuses: Default::default(),
            users: Vec::new(),
        }
    }

    #[test_timeout::timeout]
    fn pending_members_get_init_first_then_newer_updates() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("c1".into(), Principal::new("u"), tx);

        assert!(registry.attach_pending("r", "c1"));
        registry.deliver(&envelope(update(2), None));
        registry.deliver(&envelope(update(3), None));
        registry.activate("r", "c1", 2, init());
        registry.deliver(&envelope(update(2), None));
        registry.deliver(&envelope(update(4), None));

        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::Init { .. }));
        assert_eq!(rx.try_recv().unwrap().order(), Some(3));
        assert_eq!(rx.try_recv().unwrap().order(), Some(4));
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn buffered_membership_events_covered_by_init_are_dropped() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("c1".into(), Principal::new("u"), tx);
        let join = |revision, user: &str| RoomEnvelope {
            room: "r".into(),
            exclude: None,
            revision: Some(revision),
            event: ServerEvent::Join {
                room: "r".into(),
                connection: format!("{user}-conn"),
                user: user.into(),
                color: "teal".into(),
            },
        };

        registry.attach_pending("r", "c1");
        // ana joined before the snapshot was read, ben after
        registry.deliver(&join(1, "ana"));
        registry.deliver(&join(3, "ben"));
        registry.activate("r", "c1", 2, init());

        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::Init { .. }));
        match rx.try_recv().unwrap() {
            ServerEvent::Join { user, .. } => assert_eq!(user, "ben"),
            other => panic!("expected join, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn excluded_connection_is_skipped() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.register("c1".into(), Principal::new("u1"), tx1);
        registry.register("c2".into(), Principal::new("u2"), tx2);
        for id in ["c1", "c2"] {
            registry.attach_pending("r", id);
            registry.activate("r", id, 0, init());
        }
        let _ = rx1.try_recv();
        let _ = rx2.try_recv();

        registry.deliver(&envelope(update(1), Some("c1")));
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap().order(), Some(1));
    }

    #[test_timeout::timeout]
    fn detach_tracks_participation_and_room_index() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let local = registry.register("c1".into(), Principal::new("u"), tx);
        registry.attach_pending("r", "c1");
        registry.activate("r", "c1", 0, init());
        assert_eq!(local.participation("r"), Participation::Joined);
        assert!(registry.has_local_members("r"));

        assert!(registry.detach("r", "c1"));
        assert!(!registry.detach("r", "c1"));
        assert_eq!(local.participation("r"), Participation::Unjoined);
        assert!(!registry.has_local_members("r"));
        assert!(registry.local_rooms().is_empty());
    }
}
