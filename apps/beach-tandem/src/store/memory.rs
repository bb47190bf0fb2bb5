use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{
    expand_fields, Applied, Departure, Discarded, FocusOutcome, JoinedRoom, NewParticipant,
    Participant, RoomSnapshot, RoomStateStore, StoreError, StoreResult,
};
use crate::protocol::{Changes, Focuses};
use crate::room::{pick_color, RoomId, RoomMeta};

/// In-process store. Clones share state, so several nodes in one process see one cluster.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Faults>,
}

#[derive(Default)]
struct Faults {
    unavailable: AtomicBool,
    fail_next: AtomicU32,
    /// Operation name to the number of its next calls that fail.
    targeted: Mutex<HashMap<&'static str, u32>>,
}

#[derive(Default)]
struct MemoryState {
    rooms: HashMap<RoomId, MemoryRoom>,
    claims: HashMap<String, Instant>,
    nodes: HashMap<String, Instant>,
    enabled: Option<bool>,
}

struct MemoryRoom {
    meta: RoomMeta,
    changes: Changes,
    focuses: Focuses,
    participants: Vec<Participant>,
    seq: u64,
    revision: u64,
    expires_at: Option<Instant>,
}

impl MemoryRoom {
    fn has(&self, connection: &str) -> bool {
        self.participants
            .iter()
            .any(|participant| participant.connection == connection)
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            meta: self.meta.clone(),
            changes: self.changes.clone(),
            focuses: self.focuses.clone(),
            participants: self.participants.clone(),
            order: self.seq,
            revision: self.revision,
        }
    }

    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn locked_by_other(&self, connection: &str, field: &str) -> bool {
        self.focuses
            .iter()
            .any(|(holder, focused)| focused == field && holder != connection)
    }

    fn remove_fields(&mut self, fields: Vec<String>) -> Discarded {
        let fields: Vec<String> = fields
            .into_iter()
            .filter(|field| self.changes.remove(field).is_some())
            .collect();
        let revision = if fields.is_empty() {
            self.revision
        } else {
            self.bump()
        };
        Discarded { fields, revision }
    }
}

impl MemoryState {
    fn live_room(&mut self, room: &str) -> Option<&mut MemoryRoom> {
        let expired = self
            .rooms
            .get(room)
            .and_then(|entry| entry.expires_at)
            .map(|at| at <= Instant::now())
            .unwrap_or(false);
        if expired {
            self.rooms.remove(room);
        }
        self.rooms.get_mut(room)
    }

    fn member_room(&mut self, room: &str, connection: &str) -> StoreResult<&mut MemoryRoom> {
        let entry = self
            .live_room(room)
            .ok_or_else(|| StoreError::RoomNotFound(room.to_string()))?;
        if !entry.has(connection) {
            return Err(StoreError::NotParticipant(room.to_string()));
        }
        Ok(entry)
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.rooms
            .retain(|_, entry| entry.expires_at.map(|at| at > now).unwrap_or(true));
        self.claims.retain(|_, at| *at > now);
        self.nodes.retain(|_, at| *at > now);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` calls with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.faults.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` calls of one operation, e.g. `"snapshot"`, leaving the rest
    /// of the store untouched.
    pub fn fail_next_call(&self, operation: &'static str, count: u32) {
        self.faults.targeted.lock().insert(operation, count);
    }

    fn check_call(&self, operation: &'static str) -> StoreResult<()> {
        let mut targeted = self.faults.targeted.lock();
        match targeted.get_mut(operation) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(StoreError::Unavailable(format!("injected {operation} fault")))
            }
            _ => Ok(()),
        }
    }

    fn check(&self) -> StoreResult<()> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        let consumed = self
            .faults
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(StoreError::Unavailable("injected transient fault".into()));
        }
        Ok(())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> StoreResult<T>) -> StoreResult<T> {
        self.check()?;
        let mut state = self.state.lock();
        f(&mut state)
    }
}

#[async_trait]
impl RoomStateStore for MemoryStore {
    async fn join_room(
        &self,
        meta: &RoomMeta,
        participant: NewParticipant<'_>,
        initial_changes: &Changes,
    ) -> StoreResult<JoinedRoom> {
        self.with_state(|state| {
            let created = state.live_room(&meta.room).is_none();
            if created {
                state.rooms.insert(
                    meta.room.clone(),
                    MemoryRoom {
                        meta: meta.clone(),
                        changes: initial_changes.clone(),
                        focuses: Focuses::new(),
                        participants: Vec::new(),
                        seq: 0,
                        revision: 0,
                        expires_at: None,
                    },
                );
            }
            let entry = state
                .rooms
                .get_mut(&meta.room)
                .ok_or_else(|| StoreError::RoomNotFound(meta.room.clone()))?;
            entry.expires_at = None;

            if let Some(existing) = entry
                .participants
                .iter()
                .find(|existing| existing.connection == participant.connection)
            {
                return Ok(JoinedRoom {
                    created,
                    added: false,
                    participant: existing.clone(),
                    revision: entry.revision,
                });
            }

            let taken: Vec<&str> = entry
                .participants
                .iter()
                .map(|existing| existing.color.as_str())
                .collect();
            let color = pick_color(participant.colors, &taken)
                .cloned()
                .unwrap_or_default();
            let joined = Participant {
                connection: participant.connection.to_string(),
                user: participant.user.to_string(),
                color,
                node: participant.node.to_string(),
            };
            entry.participants.push(joined.clone());
            Ok(JoinedRoom {
                created,
                added: true,
                participant: joined,
                revision: entry.bump(),
            })
        })
    }

    async fn room_meta(&self, room: &str) -> StoreResult<Option<RoomMeta>> {
        self.with_state(|state| Ok(state.live_room(room).map(|entry| entry.meta.clone())))
    }

    async fn snapshot(&self, room: &str) -> StoreResult<Option<RoomSnapshot>> {
        self.check_call("snapshot")?;
        self.with_state(|state| Ok(state.live_room(room).map(|entry| entry.snapshot())))
    }

    async fn participants(&self, room: &str) -> StoreResult<Vec<Participant>> {
        self.with_state(|state| {
            Ok(state
                .live_room(room)
                .map(|entry| entry.participants.clone())
                .unwrap_or_default())
        })
    }

    async fn remove_participant(
        &self,
        room: &str,
        connection: &str,
        idle_ttl: Duration,
    ) -> StoreResult<Option<Departure>> {
        self.check_call("remove_participant")?;
        self.with_state(|state| {
            let entry = state
                .live_room(room)
                .ok_or_else(|| StoreError::RoomNotFound(room.to_string()))?;
            let before = entry.participants.len();
            entry
                .participants
                .retain(|participant| participant.connection != connection);
            entry.focuses.remove(connection);
            if entry.participants.len() == before {
                return Ok(None);
            }
            let remaining = entry.participants.len();
            if remaining == 0 {
                entry.expires_at = Some(Instant::now() + idle_ttl);
            }
            Ok(Some(Departure {
                remaining,
                revision: entry.bump(),
            }))
        })
    }

    async fn set_focus(
        &self,
        room: &str,
        connection: &str,
        field: Option<&str>,
    ) -> StoreResult<FocusOutcome> {
        self.with_state(|state| {
            let entry = state.member_room(room, connection)?;
            let previous = entry.focuses.get(connection).cloned();
            let Some(field) = field else {
                return Ok(match previous {
                    Some(previous) => {
                        entry.focuses.remove(connection);
                        FocusOutcome::Released {
                            previous,
                            revision: entry.bump(),
                        }
                    }
                    None => FocusOutcome::Unchanged,
                });
            };
            if previous.as_deref() == Some(field) {
                return Ok(FocusOutcome::Unchanged);
            }
            if entry.locked_by_other(connection, field) {
                return Err(StoreError::FieldLocked(field.to_string()));
            }
            entry
                .focuses
                .insert(connection.to_string(), field.to_string());
            Ok(FocusOutcome::Focused {
                previous,
                revision: entry.bump(),
            })
        })
    }

    async fn apply_update(
        &self,
        room: &str,
        connection: &str,
        field: &str,
        value: &Value,
    ) -> StoreResult<Applied> {
        self.with_state(|state| {
            let entry = state.member_room(room, connection)?;
            if entry.locked_by_other(connection, field) {
                return Err(StoreError::FieldLocked(field.to_string()));
            }
            entry.changes.insert(field.to_string(), value.clone());
            entry.seq += 1;
            Ok(Applied {
                order: entry.seq,
                revision: entry.bump(),
            })
        })
    }

    async fn discard(
        &self,
        room: &str,
        connection: &str,
        fields: &[String],
    ) -> StoreResult<Discarded> {
        self.with_state(|state| {
            let entry = state.member_room(room, connection)?;
            let targets = expand_fields(fields, entry.changes.keys());
            Ok(entry.remove_fields(targets))
        })
    }

    async fn unset(&self, room: &str, connection: &str, field: &str) -> StoreResult<Discarded> {
        self.with_state(|state| {
            let entry = state.member_room(room, connection)?;
            if entry.locked_by_other(connection, field) {
                return Err(StoreError::FieldLocked(field.to_string()));
            }
            Ok(entry.remove_fields(vec![field.to_string()]))
        })
    }

    async fn prune_saved(&self, room: &str, saved: &Changes) -> StoreResult<Option<Discarded>> {
        self.with_state(|state| {
            let Some(entry) = state.live_room(room) else {
                return Ok(None);
            };
            let fields: Vec<String> = saved
                .iter()
                .filter(|(field, value)| entry.changes.get(*field) == Some(*value))
                .map(|(field, _)| field.clone())
                .collect();
            for field in &fields {
                entry.changes.remove(field);
            }
            Ok(Some(Discarded {
                fields,
                revision: entry.bump(),
            }))
        })
    }

    async fn close_room(&self, room: &str) -> StoreResult<bool> {
        self.with_state(|state| {
            let existed = state.live_room(room).is_some();
            state.rooms.remove(room);
            Ok(existed)
        })
    }

    async fn rooms(&self) -> StoreResult<Vec<RoomMeta>> {
        self.with_state(|state| {
            state.purge_expired();
            Ok(state.rooms.values().map(|entry| entry.meta.clone()).collect())
        })
    }

    async fn rooms_for_item(
        &self,
        collection: &str,
        item: Option<&str>,
    ) -> StoreResult<Vec<RoomMeta>> {
        self.with_state(|state| {
            state.purge_expired();
            Ok(state
                .rooms
                .values()
                .filter(|entry| {
                    entry.meta.key.collection == collection
                        && entry.meta.key.item.as_deref() == item
                })
                .map(|entry| entry.meta.clone())
                .collect())
        })
    }

    async fn claim(&self, key: &str, _owner: &str, ttl: Duration) -> StoreResult<bool> {
        self.with_state(|state| {
            let now = Instant::now();
            match state.claims.get(key) {
                Some(expires_at) if *expires_at > now => Ok(false),
                _ => {
                    state.claims.insert(key.to_string(), now + ttl);
                    Ok(true)
                }
            }
        })
    }

    async fn heartbeat(&self, node: &str, ttl: Duration) -> StoreResult<()> {
        self.with_state(|state| {
            state.nodes.insert(node.to_string(), Instant::now() + ttl);
            Ok(())
        })
    }

    async fn live_nodes(&self, nodes: &[String]) -> StoreResult<HashSet<String>> {
        self.with_state(|state| {
            let now = Instant::now();
            Ok(nodes
                .iter()
                .filter(|node| state.nodes.get(*node).map(|at| *at > now).unwrap_or(false))
                .cloned()
                .collect())
        })
    }

    async fn collab_enabled(&self) -> StoreResult<Option<bool>> {
        self.with_state(|state| Ok(state.enabled))
    }

    async fn set_collab_enabled(&self, enabled: bool) -> StoreResult<()> {
        self.with_state(|state| {
            state.enabled = Some(enabled);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::{color_preference, RoomKey};
    use serde_json::json;

    fn meta() -> RoomMeta {
        RoomMeta::new(RoomKey::new("articles", Some("1".into()), None))
    }

    async fn join(store: &MemoryStore, connection: &str) -> JoinedRoom {
        let colors = color_preference(None);
        store
            .join_room(
                &meta(),
                NewParticipant {
                    connection,
                    user: "user",
                    node: "node-a",
                    colors: &colors,
                },
                &Changes::new(),
            )
            .await
            .expect("join")
    }

    #[test_timeout::tokio_timeout_test]
    async fn join_creates_once_and_is_idempotent() {
        let store = MemoryStore::new();
        let first = join(&store, "c1").await;
        assert!(first.created && first.added);
        let again = join(&store, "c1").await;
        assert!(!again.created && !again.added);
        assert_eq!(again.participant, first.participant);
        let second = join(&store, "c2").await;
        assert_ne!(second.participant.color, first.participant.color);
    }

    #[test_timeout::tokio_timeout_test]
    async fn update_allocates_gap_free_orders() {
        let store = MemoryStore::new();
        join(&store, "c1").await;
        let room = meta().room;
        for expected in 1..=5u64 {
            let applied = store
                .apply_update(&room, "c1", "title", &json!(expected))
                .await
                .unwrap();
            assert_eq!(applied.order, expected);
        }
        let snapshot = store.snapshot(&room).await.unwrap().unwrap();
        assert_eq!(snapshot.order, 5);
        // one for the join, one per update
        assert_eq!(snapshot.revision, 6);
        assert_eq!(snapshot.changes["title"], json!(5));
    }

    #[test_timeout::tokio_timeout_test]
    async fn focus_conflicts_and_releases() {
        let store = MemoryStore::new();
        join(&store, "c1").await;
        join(&store, "c2").await;
        let room = meta().room;

        let outcome = store.set_focus(&room, "c1", Some("title")).await.unwrap();
        assert!(matches!(outcome, FocusOutcome::Focused { previous: None, .. }));
        let repeat = store.set_focus(&room, "c1", Some("title")).await.unwrap();
        assert_eq!(repeat, FocusOutcome::Unchanged);

        let err = store.set_focus(&room, "c2", Some("title")).await.unwrap_err();
        assert!(matches!(err, StoreError::FieldLocked(_)));
        let err = store
            .apply_update(&room, "c2", "title", &json!("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::FieldLocked(_)));

        let moved = store.set_focus(&room, "c1", Some("body")).await.unwrap();
        assert!(matches!(
            moved,
            FocusOutcome::Focused { previous: Some(ref previous), .. } if previous == "title"
        ));
        let released = store.set_focus(&room, "c1", None).await.unwrap();
        assert!(matches!(
            released,
            FocusOutcome::Released { ref previous, .. } if previous == "body"
        ));
        assert_eq!(released.revision(), moved.revision().map(|revision| revision + 1));
    }

    #[test_timeout::tokio_timeout_test]
    async fn discard_removes_only_named_fields() {
        let store = MemoryStore::new();
        join(&store, "c1").await;
        let room = meta().room;
        store.apply_update(&room, "c1", "a", &json!(1)).await.unwrap();
        store.apply_update(&room, "c1", "b", &json!(2)).await.unwrap();

        let removed = store.discard(&room, "c1", &["a".into()]).await.unwrap();
        assert_eq!(removed.fields, vec!["a".to_string()]);
        let again = store.discard(&room, "c1", &["a".into()]).await.unwrap();
        assert!(again.fields.is_empty());
        assert_eq!(again.revision, removed.revision);

        let snapshot = store.snapshot(&room).await.unwrap().unwrap();
        assert_eq!(snapshot.changes.len(), 1);
        assert_eq!(snapshot.changes["b"], json!(2));
    }

    #[test_timeout::tokio_timeout_test]
    async fn unset_respects_other_focus_without_taking_it() {
        let store = MemoryStore::new();
        join(&store, "c1").await;
        join(&store, "c2").await;
        let room = meta().room;
        store.apply_update(&room, "c1", "title", &json!("x")).await.unwrap();
        store.set_focus(&room, "c1", Some("title")).await.unwrap();

        let err = store.unset(&room, "c2", "title").await.unwrap_err();
        assert!(matches!(err, StoreError::FieldLocked(_)));

        store.set_focus(&room, "c1", None).await.unwrap();
        let unset = store.unset(&room, "c2", "title").await.unwrap();
        assert_eq!(unset.fields, vec!["title".to_string()]);
        let snapshot = store.snapshot(&room).await.unwrap().unwrap();
        assert!(snapshot.changes.is_empty());
        assert!(snapshot.focuses.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn emptied_room_expires_after_idle_ttl() {
        let store = MemoryStore::new();
        join(&store, "c1").await;
        let room = meta().room;
        let remaining = store
            .remove_participant(&room, "c1", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(remaining.map(|departure| departure.remaining), Some(0));
        assert!(store.room_meta(&room).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.room_meta(&room).await.unwrap().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejoin_cancels_eviction() {
        let store = MemoryStore::new();
        join(&store, "c1").await;
        let room = meta().room;
        store.apply_update(&room, "c1", "a", &json!(1)).await.unwrap();
        store
            .remove_participant(&room, "c1", Duration::from_millis(20))
            .await
            .unwrap();
        let rejoined = join(&store, "c2").await;
        assert!(!rejoined.created);
        tokio::time::sleep(Duration::from_millis(40)).await;
        let snapshot = store.snapshot(&room).await.unwrap().unwrap();
        assert_eq!(snapshot.changes["a"], json!(1));
    }

    #[test_timeout::tokio_timeout_test]
    async fn claims_are_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(20);
        assert!(store.claim("k", "a", ttl).await.unwrap());
        assert!(!store.claim("k", "b", ttl).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.claim("k", "b", ttl).await.unwrap());
    }

    #[test_timeout::tokio_timeout_test]
    async fn injected_faults_are_transient() {
        let store = MemoryStore::new();
        store.fail_next(1);
        let err = store.collab_enabled().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.collab_enabled().await.unwrap(), None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn targeted_faults_hit_only_their_operation() {
        let store = MemoryStore::new();
        join(&store, "c1").await;
        let room = meta().room;
        store.fail_next_call("snapshot", 1);
        assert!(store.room_meta(&room).await.unwrap().is_some());
        assert!(store.snapshot(&room).await.unwrap_err().is_transient());
        assert!(store.snapshot(&room).await.unwrap().is_some());
    }
}
