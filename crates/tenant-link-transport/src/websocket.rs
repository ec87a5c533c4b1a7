//! WebSocket transport for tenant lifecycle events.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use tenant_link_core::{EventBroadcaster, TenantId};
use tenant_link_session::{SessionManager, SessionRegistry};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::protocol::{ClientMessage, ServerMessage};

/// Failure writing to a socket.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Socket closed")]
    Closed,
}

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    pub registry: Arc<SessionRegistry>,
    pub broadcaster: Arc<EventBroadcaster>,
}

impl WsState {
    /// Create new WebSocket state.
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry>, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            registry,
            broadcaster,
        }
    }

    /// State reading from a session manager.
    #[must_use]
    pub fn from_manager(manager: &SessionManager) -> Self {
        Self::new(manager.registry(), manager.broadcaster())
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(tenant_id): Path<String>,
    State(state): State<WsState>,
) -> impl IntoResponse {
    let tenant = TenantId::new(tenant_id);
    ws.on_upgrade(move |socket| handle_socket(socket, tenant, state))
}

/// Status snapshot handler.
pub async fn status_handler(
    Path(tenant_id): Path<String>,
    State(state): State<WsState>,
) -> Json<ServerMessage> {
    let tenant = TenantId::new(tenant_id);
    let snapshot = state.registry.status(&tenant);
    Json(ServerMessage::status(&tenant, snapshot))
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), SendError> {
    let json = serde_json::to_string(msg)?;
    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| SendError::Closed)
}

async fn handle_socket(socket: WebSocket, tenant: TenantId, state: WsState) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before the snapshot so no transition falls between the two.
    let mut events = state.broadcaster.subscribe(&tenant);

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let _ = tx.send(ServerMessage::status(&tenant, state.registry.status(&tenant)));

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match send_message(&mut sender, &msg).await {
                Ok(()) => {}
                Err(SendError::Serialize(e)) => {
                    tracing::error!("Failed to serialize message: {e}");
                }
                Err(SendError::Closed) => break,
            }
        }
    });

    let event_tx = tx.clone();
    let event_tenant = tenant.clone();
    let event_task = tokio::spawn(async move {
        loop {
            let msg = match events.recv().await {
                Ok(event) => ServerMessage::event(&event_tenant, event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(tenant = %event_tenant, skipped, "Subscriber lagged");
                    ServerMessage::Lagged { skipped }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if event_tx.send(msg).is_err() {
                break;
            }
        }
    });

    tracing::debug!(tenant = %tenant, "Subscriber connected");

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s.into(),
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                let _ = tx.send(ServerMessage::Error {
                    message: format!("Invalid message: {e}"),
                });
                continue;
            }
        };

        let reply = match client_msg {
            ClientMessage::Ping => ServerMessage::Pong,
            ClientMessage::Status => {
                ServerMessage::status(&tenant, state.registry.status(&tenant))
            }
        };
        let _ = tx.send(reply);
    }

    event_task.abort();
    send_task.abort();
    tracing::debug!(tenant = %tenant, "Subscriber disconnected");
}

/// Create the subscriber router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_router(WsState::from_manager(&manager)));
/// ```
#[must_use]
pub fn create_router(state: WsState) -> Router {
    Router::new()
        .route("/ws/{tenant_id}", get(ws_handler))
        .route("/tenants/{tenant_id}/status", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
