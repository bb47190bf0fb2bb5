use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::access::Principal;
use crate::coordinator::RoomCoordinator;
use crate::error::CollabError;
use crate::handlers::ApiError;
use crate::node::Node;
use crate::protocol::{ClientAction, ServerEvent};
use crate::registry::LocalConnection;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    access_token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

/// Authenticate before upgrading so unknown callers never get a socket.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(node): State<Arc<Node>>,
) -> Response {
    let token = params.access_token.or_else(|| bearer_token(&headers));
    let principal = match node
        .coordinator()
        .access()
        .authenticate(token.as_deref())
        .await
    {
        Ok(principal) => principal,
        Err(err) => {
            debug!(error = %err, "rejected websocket connection");
            return ApiError::Unauthenticated.into_response();
        }
    };
    let coordinator = Arc::clone(node.coordinator());
    ws.on_upgrade(move |socket| handle_socket(socket, principal, coordinator))
}

async fn handle_socket(socket: WebSocket, principal: Principal, coordinator: Arc<RoomCoordinator>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let connection = coordinator.connect(principal, tx);
    let connection_id = connection.id.clone();

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match event.to_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    error!(connection = %writer_id, error = %err, "failed to encode frame");
                    continue;
                }
            };
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        debug!(connection = %writer_id, "writer task ended");
    });

    while let Some(frame) = receiver.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                debug!(connection = %connection_id, error = %err, "websocket read failed");
                break;
            }
        };
        match message {
            Message::Text(text) => handle_frame(&coordinator, &connection, &text).await,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => handle_frame(&coordinator, &connection, &text).await,
                Err(_) => debug!(connection = %connection_id, "ignoring non-utf8 binary frame"),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    coordinator.disconnect(&connection_id).await;
    drop(connection);
    writer.abort();
}

async fn handle_frame(coordinator: &RoomCoordinator, connection: &Arc<LocalConnection>, text: &str) {
    debug!(connection = %connection.id, frame = %text, "collab frame received");
    let action = match ClientAction::parse(text) {
        Ok(action) => action,
        Err(err) => {
            debug!(connection = %connection.id, error = %err, "rejected frame");
            connection.send(ServerEvent::from_error(&err, None, None));
            return;
        }
    };
    let name = action.name();
    let room = action.room().map(str::to_string);
    if let Err(err) = coordinator.handle(connection, action).await {
        match &err {
            CollabError::TransientStore(_) => {
                error!(connection = %connection.id, action = name, error = %err, "action failed")
            }
            _ => debug!(connection = %connection.id, action = name, error = %err, "action rejected"),
        }
        connection.send(ServerEvent::from_error(&err, Some(name), room.as_deref()));
    }
}
