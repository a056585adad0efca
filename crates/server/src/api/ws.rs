//! WebSocket stream of one checkout's snapshots and events.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use tapline_core::{SessionEvent, SessionSnapshot};

use super::checkouts::ErrorResponse;
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_LAG_EVENTS, WS_MESSAGES_SENT};
use crate::state::{AppState, Checkout};

/// WebSocket message sent to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Full session snapshot. Sent on connect and after every change.
    Snapshot { snapshot: SessionSnapshot },
    Event { event: SessionEvent },
}

impl WsMessage {
    fn label(&self) -> &'static str {
        match self {
            WsMessage::Snapshot { .. } => "snapshot",
            WsMessage::Event { event } => event.label(),
        }
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.checkout(&id).await {
        Some(checkout) => ws.on_upgrade(|socket| handle_socket(socket, checkout)),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Checkout not found: {}", id),
            }),
        )
            .into_response(),
    }
}

/// Handle a single WebSocket connection.
async fn handle_socket(socket: WebSocket, checkout: Arc<Checkout>) {
    let (mut sender, mut receiver) = socket.split();

    let mut states = checkout.orchestrator.subscribe_state();
    let mut events = checkout.orchestrator.subscribe_events();
    let checkout_id = checkout.id.clone();
    drop(checkout);

    WS_CONNECTIONS_TOTAL.inc();
    WS_CONNECTIONS_ACTIVE.inc();

    info!(checkout_id = %checkout_id, "WebSocket client connected");

    let send_task = tokio::spawn(async move {
        let initial = WsMessage::Snapshot {
            snapshot: states.borrow_and_update().clone(),
        };
        let mut next = Some(initial);

        loop {
            if let Some(msg) = next.take() {
                WS_MESSAGES_SENT.with_label_values(&[msg.label()]).inc();
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            debug!("WebSocket send failed, client disconnected");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Failed to serialize WsMessage: {}", e);
                    }
                }
            }

            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        debug!("Session dropped, closing stream");
                        break;
                    }
                    next = Some(WsMessage::Snapshot {
                        snapshot: states.borrow_and_update().clone(),
                    });
                }
                result = events.recv() => {
                    match result {
                        Ok(event) => next = Some(WsMessage::Event { event }),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("WebSocket client lagged, skipped {} events", n);
                            WS_LAG_EVENTS.inc();
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Event channel closed");
                            break;
                        }
                    }
                }
            }
        }
    });

    // Handle incoming messages from client (ping/pong, close)
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Close(_)) => {
                debug!("WebSocket client requested close");
                break;
            }
            Ok(Message::Text(text)) => {
                debug!("Ignoring client text message: {}", text);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket receive error: {}", e);
                break;
            }
        }
    }

    send_task.abort();
    WS_CONNECTIONS_ACTIVE.dec();
    info!(checkout_id = %checkout_id, "WebSocket client disconnected");
}
