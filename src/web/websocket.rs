//! WebSocket handler for JSON-RPC communication and event push.

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};
use tokio::sync::broadcast::error::RecvError;

use super::WebState;
use crate::rpc::Notification;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WebState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: WebState) {
    let mut events = state.handler.orchestrator().subscribe();

    loop {
        let outgoing = tokio::select! {
            msg = socket.recv() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ignore binary, ping, pong
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "WebSocket receive error");
                        break;
                    }
                };

                match state.handler.handle_text(&text).await {
                    Some(response) => serde_json::to_string(&response),
                    None => continue,
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => serde_json::to_string(&Notification::event(&event)),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "WebSocket subscriber lagged, events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };

        let text = match outgoing {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize WebSocket message");
                continue;
            }
        };

        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }

    tracing::debug!("WebSocket connection closed");
}
