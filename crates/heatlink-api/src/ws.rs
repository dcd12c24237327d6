//! WebSocket gateway.
//!
//! Streams the typed event feed as JSON frames and accepts command messages
//! from the client. Each command is answered with an `ack` frame carrying
//! the dispatcher's verdict.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use heatlink_core::{Command, CommandSource};

use crate::ApiState;

/// Inbound command frame.
#[derive(Debug, Deserialize)]
struct CommandFrame {
    device_id: String,
    command: Command,
}

pub async fn events(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ApiState) {
    let mut events = state.store.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let frame = json!({ "type": "event", "event": event });
                    if socket.send(Message::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "websocket subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) => {
                    let ack = handle_command(&state, &text).await;
                    if socket.send(Message::Text(ack.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "websocket receive error");
                    break;
                }
            },
        }
    }
    debug!("websocket client disconnected");
}

async fn handle_command(state: &ApiState, text: &str) -> serde_json::Value {
    let frame: CommandFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            return json!({ "type": "ack", "ok": false, "error": format!("bad frame: {err}") });
        }
    };

    match state
        .commands
        .request(frame.device_id.clone(), frame.command, CommandSource::WebSocket)
        .await
    {
        Ok(()) => json!({ "type": "ack", "ok": true, "device_id": frame.device_id }),
        Err(err) => {
            json!({ "type": "ack", "ok": false, "device_id": frame.device_id, "error": err.to_string() })
        }
    }
}
