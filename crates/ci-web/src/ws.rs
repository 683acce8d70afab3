//! WebSocket handler streaming build/job lifecycle events.
//!
//! Clients connect to `/ws` and receive every [`ci_kernel::BuildEvent`]
//! published to the orchestrator's [`ci_kernel::BroadcastSink`] as a JSON
//! text frame, for as long as the connection stays open. There is no
//! inbound protocol -- this is a push-only fan-out.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Axum handler that upgrades the HTTP connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Stream [`ci_kernel::BuildEvent`]s to a single connected client until it
/// disconnects or falls permanently behind.
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    info!("websocket client connected");
    let mut events = state.orchestrator.events().subscribe();

    loop {
        match events.recv().await {
            Ok(event) => {
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "failed to serialize build event");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            // Drop-oldest policy: a lagged subscriber just resumes from the
            // newest available event instead of closing.
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "websocket subscriber lagged, resuming from latest");
                continue;
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("websocket client disconnected");
}
