use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::AccessError;
use crate::store::StoreError;

/// Machine-readable codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidPayload,
    NotFound,
    Forbidden,
    ServiceUnavailable,
    Internal,
}

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("invalid payload: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Unauthorized(String),
    #[error("field {field} is already focused by another user")]
    Conflict { field: String },
    #[error("collaborative editing is disabled")]
    ServiceUnavailable,
    #[error("shared store unavailable: {0}")]
    TransientStore(String),
}

impl CollabError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CollabError::Validation(_) => ErrorCode::InvalidPayload,
            CollabError::NotFound(_) => ErrorCode::NotFound,
            CollabError::Unauthorized(_) | CollabError::Conflict { .. } => ErrorCode::Forbidden,
            CollabError::ServiceUnavailable => ErrorCode::ServiceUnavailable,
            CollabError::TransientStore(_) => ErrorCode::Internal,
        }
    }

    pub fn room_not_found(room: &str) -> Self {
        CollabError::NotFound(format!("room {room} does not exist"))
    }

    pub fn not_in_room(room: &str) -> Self {
        CollabError::NotFound(format!("connection is not part of room {room}"))
    }
}

impl From<StoreError> for CollabError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RoomNotFound(room) => CollabError::room_not_found(&room),
            StoreError::NotParticipant(room) => CollabError::not_in_room(&room),
            StoreError::FieldLocked(field) => CollabError::Conflict { field },
            other => CollabError::TransientStore(other.to_string()),
        }
    }
}

impl From<AccessError> for CollabError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::NotFound(what) => CollabError::NotFound(what),
            AccessError::Unavailable(reason) => CollabError::TransientStore(reason),
            other => CollabError::Unauthorized(other.to_string()),
        }
    }
}

impl From<transport_bus::BusError> for CollabError {
    fn from(err: transport_bus::BusError) -> Self {
        CollabError::TransientStore(err.to_string())
    }
}
