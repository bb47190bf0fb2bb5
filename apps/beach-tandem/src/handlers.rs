use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::error::CollabError;
use crate::node::Node;
use crate::protocol::{item_key, Changes, Focuses, UserInfo};
use crate::room::RoomId;

pub const HOOK_SECRET_HEADER: &str = "x-collab-hook-secret";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Collab(#[from] CollabError),
    #[error("missing or invalid credentials")]
    Unauthenticated,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Collab(err) => match err {
                CollabError::Validation(_) => StatusCode::BAD_REQUEST,
                CollabError::NotFound(_) => StatusCode::NOT_FOUND,
                CollabError::Unauthorized(_) => StatusCode::FORBIDDEN,
                CollabError::Conflict { .. } => StatusCode::CONFLICT,
                CollabError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                CollabError::TransientStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            debug!(error = %self, %status, "request rejected");
        }
        let body = match &self {
            ApiError::Collab(err) => json!({ "code": err.code(), "message": err.to_string() }),
            ApiError::Unauthenticated => json!({ "code": "UNAUTHENTICATED", "message": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Hook and settings endpoints are open unless a secret is configured.
fn check_hook_secret(node: &Node, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = node.config().hook_secret.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(HOOK_SECRET_HEADER)
        .and_then(|value| value.to_str().ok());
    if presented == Some(expected) {
        Ok(())
    } else {
        Err(ApiError::Unauthenticated)
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    node: String,
    collab_enabled: bool,
    connections: usize,
    rooms: usize,
}

pub async fn health_check(State(node): State<Arc<Node>>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        node: node.id().to_string(),
        collab_enabled: node.bridge().is_enabled(),
        connections: node.coordinator().registry().connection_count(),
        rooms: node.coordinator().registry().local_rooms().len(),
    })
}

pub async fn render_metrics(State(node): State<Arc<Node>>) -> String {
    node.metrics().render()
}

#[derive(Debug, Deserialize)]
pub struct ItemSavedHook {
    pub collection: String,
    #[serde(default, deserialize_with = "item_key")]
    pub item: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub timestamp: String,
    /// Saved values, used to clear dirty entries that now match the record.
    #[serde(default)]
    pub fields: Option<Changes>,
}

#[derive(Debug, Deserialize)]
pub struct ItemDeletedHook {
    pub collection: String,
    #[serde(default, deserialize_with = "item_key")]
    pub item: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Rooms this node announced the event to. Other nodes may have announced the rest.
#[derive(Debug, Serialize, Deserialize)]
pub struct HookResponse {
    pub rooms: Vec<RoomId>,
}

pub async fn item_saved(
    State(node): State<Arc<Node>>,
    headers: HeaderMap,
    Json(hook): Json<ItemSavedHook>,
) -> ApiResult<Json<HookResponse>> {
    check_hook_secret(&node, &headers)?;
    let rooms = node
        .bridge()
        .on_item_saved(
            &hook.collection,
            hook.item.as_deref(),
            hook.version.as_deref(),
            &hook.timestamp,
            hook.fields.as_ref(),
        )
        .await?;
    Ok(Json(HookResponse { rooms }))
}

pub async fn item_deleted(
    State(node): State<Arc<Node>>,
    headers: HeaderMap,
    Json(hook): Json<ItemDeletedHook>,
) -> ApiResult<Json<HookResponse>> {
    check_hook_secret(&node, &headers)?;
    let rooms = node
        .bridge()
        .on_item_deleted(
            &hook.collection,
            hook.item.as_deref(),
            hook.timestamp.as_deref(),
        )
        .await?;
    Ok(Json(HookResponse { rooms }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CollabSettings {
    pub enabled: bool,
}

pub async fn get_collab_settings(
    State(node): State<Arc<Node>>,
    headers: HeaderMap,
) -> ApiResult<Json<CollabSettings>> {
    check_hook_secret(&node, &headers)?;
    Ok(Json(CollabSettings {
        enabled: node.bridge().is_enabled(),
    }))
}

pub async fn put_collab_settings(
    State(node): State<Arc<Node>>,
    headers: HeaderMap,
    Json(settings): Json<CollabSettings>,
) -> ApiResult<Json<CollabSettings>> {
    check_hook_secret(&node, &headers)?;
    node.bridge().set_enabled(settings.enabled).await?;
    info!(enabled = settings.enabled, "collaborative editing flag set");
    Ok(Json(settings))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoomView {
    pub room: RoomId,
    pub collection: String,
    pub item: Option<String>,
    pub version: Option<String>,
    pub changes: Changes,
    pub focuses: Focuses,
    pub users: Vec<UserInfo>,
    pub order: u64,
}

pub async fn room_snapshot(
    State(node): State<Arc<Node>>,
    headers: HeaderMap,
    Path(room): Path<String>,
) -> ApiResult<Json<RoomView>> {
    check_hook_secret(&node, &headers)?;
    let snapshot = node
        .coordinator()
        .store()
        .snapshot(&room)
        .await
        .map_err(CollabError::from)?
        .ok_or_else(|| CollabError::room_not_found(&room))?;
    Ok(Json(RoomView {
        room: snapshot.meta.room,
        collection: snapshot.meta.key.collection,
        item: snapshot.meta.key.item,
        version: snapshot.meta.key.version,
        changes: snapshot.changes,
        focuses: snapshot.focuses,
        users: snapshot
            .participants
            .iter()
            .map(|participant| participant.user_info())
            .collect(),
        order: snapshot.order,
    }))
}
