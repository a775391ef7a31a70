//! One-way log stream for the monitor UI.
//!
//! On connect the replay buffer (~200 recent events) is delivered, then
//! live events stream as they happen. The client may send a bare `"ping"`
//! or `{"type": "get_status"}`; everything else is ignored.

use axum::{
    extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};

use loreweave_core::logbus::LogEvent;

use crate::app::AppState;

/// GET /ws/logs — upgrade to the log stream.
pub async fn ws_logs_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "log monitor connected");
    state
        .ws_clients
        .insert(conn_id.clone(), chrono::Utc::now().to_rfc3339());

    let (mut tx, mut rx) = socket.split();
    let mut bus_rx = state.bus.subscribe();

    // replay buffer first, so a late monitor catches up
    for event in state.bus.replay() {
        if send_event(&mut tx, &event).await.is_err() {
            state.ws_clients.remove(&conn_id);
            return;
        }
    }

    loop {
        tokio::select! {
            event = bus_rx.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut tx, &event).await.is_err() {
                            break;
                        }
                    }
                    // lagged receivers skip ahead rather than disconnect
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!(conn_id, skipped = n, "log monitor lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let text: &str = &text;
                        if text.trim() == "ping" {
                            if send_event(&mut tx, &LogEvent::pong()).await.is_err() {
                                break;
                            }
                        } else if is_status_request(text) {
                            let snapshot = state.engine.status_snapshot().to_string();
                            if send_event(&mut tx, &LogEvent::status(snapshot)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }

    state.ws_clients.remove(&conn_id);
    info!(conn_id = %conn_id, "log monitor disconnected");
}

async fn send_event(
    tx: &mut (impl SinkExt<Message> + Unpin),
    event: &LogEvent,
) -> Result<(), ()> {
    let payload = serde_json::to_string(event).map_err(|_| ())?;
    tx.send(Message::Text(payload.into())).await.map_err(|_| ())
}

fn is_status_request(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from))
        .map(|t| t == "get_status")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_request_detection() {
        assert!(is_status_request(r#"{"type": "get_status"}"#));
        assert!(!is_status_request(r#"{"type": "other"}"#));
        assert!(!is_status_request("ping"));
        assert!(!is_status_request("not json"));
    }
}
