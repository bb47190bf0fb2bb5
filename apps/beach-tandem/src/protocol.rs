//! Wire format of the `collab` WebSocket envelope.
//!
//! Every frame is a JSON object `{"type": "collab", "action": ..., ...}`. Inbound frames
//! decode into [`ClientAction`]; outbound frames are built from [`ServerEvent`].

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{CollabError, ErrorCode};
use crate::room::{ConnectionId, RoomId};

pub const COLLAB_TYPE: &str = "collab";

/// Dirty map: field to latest unsaved value.
pub type Changes = Map<String, Value>;

/// Focus map: connection to the field it is editing.
pub type Focuses = BTreeMap<ConnectionId, String>;

/// Messages sent from a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientAction {
    Join {
        collection: String,
        #[serde(default, deserialize_with = "item_key")]
        item: Option<String>,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        color: Option<String>,
        #[serde(default, rename = "initialChanges")]
        initial_changes: Option<Changes>,
    },
    Leave {
        #[serde(default)]
        room: Option<RoomId>,
    },
    Focus {
        room: RoomId,
        #[serde(default)]
        field: Option<String>,
    },
    /// `changes` absent unsets the field; an explicit `null` is a value.
    Update {
        room: RoomId,
        field: String,
        #[serde(default, deserialize_with = "present")]
        changes: Option<Value>,
    },
    UpdateAll {
        room: RoomId,
        changes: Changes,
    },
    Discard {
        room: RoomId,
        fields: Vec<String>,
    },
    Ping,
}

impl ClientAction {
    /// Decode a text frame, checking the envelope type first.
    pub fn parse(text: &str) -> Result<Self, CollabError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|err| CollabError::Validation(format!("malformed frame: {err}")))?;
        match value.get("type").and_then(Value::as_str) {
            Some(COLLAB_TYPE) => {}
            Some(other) => {
                return Err(CollabError::Validation(format!(
                    "unsupported message type {other}"
                )))
            }
            None => return Err(CollabError::Validation("missing message type".into())),
        }
        serde_json::from_value(value)
            .map_err(|err| CollabError::Validation(format!("couldn't parse payload: {err}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientAction::Join { .. } => "join",
            ClientAction::Leave { .. } => "leave",
            ClientAction::Focus { .. } => "focus",
            ClientAction::Update { .. } => "update",
            ClientAction::UpdateAll { .. } => "updateAll",
            ClientAction::Discard { .. } => "discard",
            ClientAction::Ping => "ping",
        }
    }

    pub fn room(&self) -> Option<&str> {
        match self {
            ClientAction::Leave { room } => room.as_deref(),
            ClientAction::Focus { room, .. }
            | ClientAction::Update { room, .. }
            | ClientAction::UpdateAll { room, .. }
            | ClientAction::Discard { room, .. } => Some(room),
            ClientAction::Join { .. } | ClientAction::Ping => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user: String,
    pub connection: ConnectionId,
    pub color: String,
}

/// Messages sent by the server, either as a reply or as a room broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ServerEvent {
    Init {
        room: RoomId,
        connection: ConnectionId,
        collection: String,
        item: Option<String>,
        version: Option<String>,
        changes: Changes,
        focuses: Focuses,
        users: Vec<UserInfo>,
    },
    Join {
        room: RoomId,
        connection: ConnectionId,
        user: String,
        color: String,
    },
    Leave {
        room: RoomId,
        connection: ConnectionId,
    },
    Focus {
        room: RoomId,
        connection: ConnectionId,
        field: Option<String>,
    },
    Update {
        room: RoomId,
        connection: ConnectionId,
        field: String,
        changes: Value,
        order: u64,
    },
    Discard {
        room: RoomId,
        fields: Vec<String>,
    },
    Save {
        room: RoomId,
    },
    Delete {
        room: RoomId,
    },
    Error {
        code: ErrorCode,
        message: String,
        /// The client action that failed. `action` itself is the envelope tag.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<RoomId>,
    },
    Pong,
}

impl ServerEvent {
    pub fn from_error(err: &CollabError, trigger: Option<&str>, room: Option<&str>) -> Self {
        ServerEvent::Error {
            code: err.code(),
            message: err.to_string(),
            trigger: trigger.map(str::to_string),
            room: room.map(str::to_string),
        }
    }

    pub fn service_unavailable(room: Option<&str>) -> Self {
        Self::from_error(&CollabError::ServiceUnavailable, None, room)
    }

    /// The room this event belongs to, if any.
    pub fn room(&self) -> Option<&str> {
        match self {
            ServerEvent::Init { room, .. }
            | ServerEvent::Join { room, .. }
            | ServerEvent::Leave { room, .. }
            | ServerEvent::Focus { room, .. }
            | ServerEvent::Update { room, .. }
            | ServerEvent::Discard { room, .. }
            | ServerEvent::Save { room }
            | ServerEvent::Delete { room } => Some(room),
            ServerEvent::Error { room, .. } => room.as_deref(),
            ServerEvent::Pong => None,
        }
    }

    /// Sequence number stamped on room-ordered events.
    pub fn order(&self) -> Option<u64> {
        match self {
            ServerEvent::Update { order, .. } => Some(*order),
            _ => None,
        }
    }

    /// Serialize as a complete envelope frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("type".into(), Value::String(COLLAB_TYPE.into()));
        }
        serde_json::to_string(&value)
    }
}

/// Item keys arrive as strings or numbers; both are kept as strings.
pub(crate) fn item_key<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(key)) => Ok(Some(key)),
        Some(Value::Number(key)) => Ok(Some(key.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "item key must be a string or number, got {other}"
        ))),
    }
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn parses_join_with_numeric_item() {
        let action = ClientAction::parse(
            r#"{"type":"collab","action":"join","collection":"articles","item":42,"version":null}"#,
        )
        .unwrap();
        assert_eq!(
            action,
            ClientAction::Join {
                collection: "articles".into(),
                item: Some("42".into()),
                version: None,
                color: None,
                initial_changes: None,
            }
        );
    }

    #[test_timeout::timeout]
    fn update_distinguishes_null_from_absent() {
        let set_null = ClientAction::parse(
            r#"{"type":"collab","action":"update","room":"r","field":"title","changes":null}"#,
        )
        .unwrap();
        assert!(matches!(
            set_null,
            ClientAction::Update { changes: Some(Value::Null), .. }
        ));

        let unset =
            ClientAction::parse(r#"{"type":"collab","action":"update","room":"r","field":"title"}"#)
                .unwrap();
        assert!(matches!(unset, ClientAction::Update { changes: None, .. }));
    }

    #[test_timeout::timeout]
    fn rejects_foreign_envelope_types() {
        let err = ClientAction::parse(r#"{"type":"subscribe","action":"join"}"#).unwrap_err();
        assert!(matches!(err, CollabError::Validation(_)));

        let err = ClientAction::parse(r#"{"type":"collab","action":"teleport"}"#).unwrap_err();
        assert!(matches!(err, CollabError::Validation(_)));
    }

    #[test_timeout::timeout]
    fn update_all_uses_camel_case_action() {
        let action = ClientAction::parse(
            r#"{"type":"collab","action":"updateAll","room":"r","changes":{"a":1}}"#,
        )
        .unwrap();
        assert_eq!(action.name(), "updateAll");
        assert_eq!(action.room(), Some("r"));
    }

    #[test_timeout::timeout]
    fn frames_carry_collab_type() {
        let frame = ServerEvent::Update {
            room: "r".into(),
            connection: "c".into(),
            field: "title".into(),
            changes: json!("Dirty State"),
            order: 3,
        }
        .to_frame()
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "collab");
        assert_eq!(value["action"], "update");
        assert_eq!(value["order"], 3);

        let decoded: ServerEvent = serde_json::from_str(&frame).unwrap();
        assert_eq!(decoded.order(), Some(3));
    }

    #[test_timeout::timeout]
    fn error_frames_omit_empty_context() {
        let frame = ServerEvent::service_unavailable(None).to_frame().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["code"], "SERVICE_UNAVAILABLE");
        assert!(value.get("room").is_none());
        assert!(value.get("trigger").is_none());
    }

    #[test_timeout::timeout]
    fn error_frames_keep_their_tag_and_name_the_failed_action() {
        let err = CollabError::Unauthorized("no read access".into());
        let frame = ServerEvent::from_error(&err, Some("join"), Some("r"))
            .to_frame()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "collab");
        assert_eq!(value["action"], "error");
        assert_eq!(value["trigger"], "join");
        assert_eq!(value["room"], "r");

        let decoded: ServerEvent = serde_json::from_str(&frame).unwrap();
        assert!(matches!(
            decoded,
            ServerEvent::Error { trigger: Some(ref trigger), .. } if trigger == "join"
        ));
    }
}
