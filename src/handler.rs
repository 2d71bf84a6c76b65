//! WebSocket connection handler.
//!
//! Owns one connection for its whole lifetime: parses client frames, feeds
//! them to the relay engine in arrival order, and drains the connection's
//! outbound channel into the socket from a separate writer task.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::presence::ConnectionHandle;
use crate::protocol::{ClientMessage, ConnectionId, ServerMessage};
use crate::relay::{Session, SessionState};
use crate::state::RelayState;

/// Handle a single WebSocket connection.
///
/// 1. Spawns a sender task that serializes outbound events onto the socket
/// 2. Processes incoming frames one at a time until the socket closes
/// 3. Disconnects the session, which may announce the user went offline
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create the outbound channel for this client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let connection_id = ConnectionId::new();
    let mut session = Session::new(ConnectionHandle::new(connection_id, tx));

    tracing::debug!(connection = %connection_id, "WebSocket connected");

    // ── Sender Task ───────────────────────────────────────────────────────

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                }
            }
        }
    });

    // ── Process Messages ──────────────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    state.engine.handle(&mut session, client_msg).await;
                }
                Err(e) => {
                    tracing::warn!(
                        connection = %connection_id,
                        error = %e,
                        "Failed to parse client message"
                    );
                    if matches!(session.state(), SessionState::Authenticated(_)) {
                        session.reply(ServerMessage::error(format!(
                            "Invalid message format: {}",
                            e
                        )));
                    }
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {
                // Binary frames are not part of the protocol; ping/pong
                // control frames are answered by axum.
            }
            Err(e) => {
                tracing::debug!(connection = %connection_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────

    let user = session.user();
    state.engine.disconnect(&mut session);
    sender_task.abort();

    match user {
        Some(user) => tracing::info!(user_id = %user, connection = %connection_id, "WebSocket disconnected"),
        None => tracing::debug!(connection = %connection_id, "Unauthenticated WebSocket closed"),
    }
}
