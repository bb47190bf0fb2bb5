//! Cluster-shared room state.
//!
//! Every operation that more than one node may race on is a single atomic step of the
//! backing store, so callers never hold a lock across a round trip.
//!
//! Each room carries two counters. `order` numbers updates and is what clients see.
//! `revision` is bumped by every mutation that gets broadcast, so receiving nodes can
//! put all room traffic back in store order and tell what a joining snapshot covers.

mod memory;
mod redis_store;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{Changes, Focuses, UserInfo};
use crate::room::{ConnectionId, RoomId, RoomMeta};

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("room {0} does not exist")]
    RoomNotFound(RoomId),
    #[error("connection is not a participant of room {0}")]
    NotParticipant(RoomId),
    #[error("field {0} is focused by another connection")]
    FieldLocked(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt store entry: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Only connectivity failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub connection: ConnectionId,
    pub user: String,
    pub color: String,
    /// Node holding the participant's socket.
    pub node: String,
}

impl Participant {
    pub fn user_info(&self) -> UserInfo {
        UserInfo {
            user: self.user.clone(),
            connection: self.connection.clone(),
            color: self.color.clone(),
        }
    }
}

/// A participant about to join; the store assigns the colour.
#[derive(Debug, Clone)]
pub struct NewParticipant<'a> {
    pub connection: &'a str,
    pub user: &'a str,
    pub node: &'a str,
    /// Colours in order of preference.
    pub colors: &'a [String],
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRoom {
    /// The room entry did not exist before this join.
    pub created: bool,
    /// The connection was not already a participant.
    pub added: bool,
    pub participant: Participant,
    /// Revision of the join when `added`, otherwise the room's current one.
    pub revision: u64,
}

/// Everything a joining client needs, read in one consistent step.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
    pub meta: RoomMeta,
    pub changes: Changes,
    pub focuses: Focuses,
    pub participants: Vec<Participant>,
    /// Last order number handed out.
    pub order: u64,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusOutcome {
    Focused {
        previous: Option<String>,
        revision: u64,
    },
    Released {
        previous: String,
        revision: u64,
    },
    /// Already in the requested state.
    Unchanged,
}

impl FocusOutcome {
    pub fn revision(&self) -> Option<u64> {
        match self {
            FocusOutcome::Focused { revision, .. } | FocusOutcome::Released { revision, .. } => {
                Some(*revision)
            }
            FocusOutcome::Unchanged => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub order: u64,
    pub revision: u64,
}

/// Fields removed from the dirty map. The revision only moves when `fields` is non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discarded {
    pub fields: Vec<String>,
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub remaining: usize,
    pub revision: u64,
}

#[async_trait]
pub trait RoomStateStore: Send + Sync {
    /// Create the room if needed, cancel any pending eviction and add the participant.
    async fn join_room(
        &self,
        meta: &RoomMeta,
        participant: NewParticipant<'_>,
        initial_changes: &Changes,
    ) -> StoreResult<JoinedRoom>;

    async fn room_meta(&self, room: &str) -> StoreResult<Option<RoomMeta>>;

    async fn snapshot(&self, room: &str) -> StoreResult<Option<RoomSnapshot>>;

    async fn participants(&self, room: &str) -> StoreResult<Vec<Participant>>;

    /// Remove the participant and its focus. Returns `None` when the connection was not a
    /// participant. An emptied room expires after `idle_ttl` unless someone joins again.
    async fn remove_participant(
        &self,
        room: &str,
        connection: &str,
        idle_ttl: Duration,
    ) -> StoreResult<Option<Departure>>;

    /// Focus `field`, or release focus when `field` is `None`.
    async fn set_focus(
        &self,
        room: &str,
        connection: &str,
        field: Option<&str>,
    ) -> StoreResult<FocusOutcome>;

    /// Store the field's value and allocate the room's next order number in one step.
    async fn apply_update(
        &self,
        room: &str,
        connection: &str,
        field: &str,
        value: &Value,
    ) -> StoreResult<Applied>;

    /// Remove the named fields (`*` for all), whoever is editing them.
    async fn discard(&self, room: &str, connection: &str, fields: &[String])
        -> StoreResult<Discarded>;

    /// Remove one field unless another connection has it focused. Focus is left alone.
    async fn unset(&self, room: &str, connection: &str, field: &str) -> StoreResult<Discarded>;

    /// Drop dirty entries whose value still equals `saved` and bump the revision for the
    /// save announcement. `None` when the room is gone.
    async fn prune_saved(&self, room: &str, saved: &Changes) -> StoreResult<Option<Discarded>>;

    /// Remove the room entry. Returns whether it existed.
    async fn close_room(&self, room: &str) -> StoreResult<bool>;

    async fn rooms(&self) -> StoreResult<Vec<RoomMeta>>;

    async fn rooms_for_item(&self, collection: &str, item: Option<&str>)
        -> StoreResult<Vec<RoomMeta>>;

    /// Set-if-absent with expiry. `true` means this caller owns the claim.
    async fn claim(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool>;

    async fn heartbeat(&self, node: &str, ttl: Duration) -> StoreResult<()>;

    /// Which of `nodes` still have a live heartbeat.
    async fn live_nodes(&self, nodes: &[String]) -> StoreResult<HashSet<String>>;

    async fn collab_enabled(&self) -> StoreResult<Option<bool>>;

    async fn set_collab_enabled(&self, enabled: bool) -> StoreResult<()>;
}

pub(crate) fn room_key(room: &str, part: &str) -> String {
    format!("collab:room:{}:{}", room, part)
}

pub(crate) fn item_index_key(collection: &str, item: Option<&str>) -> String {
    format!("collab:item:{}:{}", collection, item.unwrap_or(""))
}

pub(crate) const ROOMS_KEY: &str = "collab:rooms";
pub(crate) const SETTINGS_KEY: &str = "collab:settings";

pub(crate) fn claim_key(key: &str) -> String {
    format!("collab:claim:{}", key)
}

pub(crate) fn node_key(node: &str) -> String {
    format!("collab:node:{}", node)
}

/// Field list with `*` expanded against the current dirty map.
pub(crate) fn expand_fields<'a>(
    fields: &'a [String],
    present: impl Iterator<Item = &'a String>,
) -> Vec<String> {
    if fields.iter().any(|field| field == "*") {
        present.cloned().collect()
    } else {
        let mut seen = HashSet::new();
        fields
            .iter()
            .filter(|field| seen.insert(field.as_str()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn wildcard_expands_to_present_fields() {
        let present = vec!["a".to_string(), "b".to_string()];
        let fields = vec!["*".to_string()];
        assert_eq!(expand_fields(&fields, present.iter()), present);
    }

    #[test_timeout::timeout]
    fn explicit_fields_are_deduplicated() {
        let present: Vec<String> = Vec::new();
        let fields = vec!["a".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(
            expand_fields(&fields, present.iter()),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
