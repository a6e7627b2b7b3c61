//! WebSocket sessions
//!
//! Connects are refused before the upgrade when the origin is not allowed or
//! the rune fails the probe. Accepted sessions receive every broadcast frame
//! until they close.

use std::sync::Arc;

use axum::{
    Json,
    extract::{
        State,
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tracing::debug;

use super::auth::{Decision, Surface, rune_from_headers};
use super::broadcast::{MESSAGE_EVENT, SessionRegistry, frame};
use super::router::AppState;

/// Event sent to a session right after it is registered
pub const CONNECTED_EVENT: &str = "connected";

/// `GET /ws` upgrade handler
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.origins.allows_request(&headers) {
        debug!("Websocket connect refused: origin not allowed");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": {"code": 403, "message": "Origin not allowed"}})),
        )
            .into_response();
    }

    let rune = rune_from_headers(&headers);
    match state.gate.authorize_connect(rune).await {
        Decision::Allow => {}
        Decision::Deny(denial) => {
            debug!(error = %denial.error_object(), "Websocket connect refused");
            return (
                denial.http_status(Surface::Socket),
                Json(json!({"error": denial.error_object()})),
            )
                .into_response();
        }
    }

    let rune = rune.unwrap_or_default().to_string();
    let sessions = Arc::clone(&state.sessions);
    ws.on_upgrade(move |socket| run_session(socket, sessions, rune))
}

/// Drive one accepted connection until either side closes
async fn run_session(socket: WebSocket, sessions: Arc<SessionRegistry>, rune: String) {
    let (id, mut outbound) = sessions.register(&rune);
    debug!(session_id = %id, "Websocket connection established");

    let (mut sink, mut inbound) = socket.split();
    let hello = frame(CONNECTED_EVENT, &json!({ "session": id }));

    if sink.send(Message::Text(hello)).await.is_ok() {
        loop {
            tokio::select! {
                out = outbound.recv() => {
                    let Some(out) = out else { break };
                    if sink.send(Message::Text(out)).await.is_err() {
                        break;
                    }
                }
                msg = inbound.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(session_id = %id, "Received message from client");
                        let echo = json!({
                            "client_message": client_message(&text),
                            "session": id,
                        });
                        sessions.broadcast(&frame(MESSAGE_EVENT, &echo));
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(session_id = %id, "Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(session_id = %id, error = %e, "Websocket error");
                        break;
                    }
                },
            }
        }
    }

    sessions.remove(&id);
    debug!(session_id = %id, unsent = outbound.backlog(), "Websocket connection closed");
}

/// Payload of a client frame: the `data` of a `{"event":"message"}` envelope,
/// any other JSON value as-is, or the raw text
fn client_message(text: &Utf8Bytes) -> Value {
    match serde_json::from_str::<Value>(text.as_str()) {
        Ok(Value::Object(mut envelope))
            if envelope.get("event").and_then(Value::as_str) == Some(MESSAGE_EVENT) =>
        {
            envelope.remove("data").unwrap_or(Value::Null)
        }
        Ok(other) => other,
        Err(_) => Value::String(text.to_string()),
    }
}
