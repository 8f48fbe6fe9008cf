//! WebSocket endpoint. Each connection registers one subscriber, runs a
//! writer task that drains the subscriber queue into the socket, and reads
//! frames only to track liveness and answer pings.

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broadcaster::Subscriber;
use crate::http_server::ServerState;

#[derive(Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
}

fn is_ping(text: &str) -> bool {
    let text = text.trim();
    text.eq_ignore_ascii_case("ping")
        || serde_json::from_str::<ClientFrame>(text)
            .map(|frame| frame.kind == "ping")
            .unwrap_or(false)
}

fn pong() -> Message {
    let body = serde_json::json!({
        "type": "pong",
        "server_time": chrono::Utc::now().timestamp_millis(),
    });
    Message::Text(body.to_string().into())
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let settings = state.config.broadcast;
    let (subscriber, mut frames) = Subscriber::channel(settings.queue_size);
    let conn_id = subscriber.id();
    let liveness = subscriber.liveness();

    if !state.broadcaster.add_subscriber(subscriber).await {
        debug!(%conn_id, "rejecting connection during shutdown");
        return;
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (reply_tx, mut replies) = mpsc::channel::<Message>(8);

    let send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(settings.heartbeat_interval);
        heartbeat.tick().await;
        loop {
            let message = tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => Message::Text(frame.to_string().into()),
                    // Dropped by the broadcaster: pruned or shutting down.
                    None => break,
                },
                Some(reply) = replies.recv() => reply,
                _ = heartbeat.tick() => Message::Ping(Bytes::new()),
            };
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) => {
                liveness.touch();
                match message {
                    Message::Text(text) if is_ping(text.as_str()) => {
                        let _ = reply_tx.send(pong()).await;
                    }
                    Message::Text(text) => {
                        debug!(%conn_id, len = text.len(), "ignoring client text frame");
                    }
                    Message::Close(_) => {
                        info!(%conn_id, "client closed connection");
                        break;
                    }
                    _ => {}
                }
            }
            Err(e) => {
                warn!(%conn_id, error = %e, "websocket read failed");
                break;
            }
        }
    }

    state.broadcaster.remove_subscriber(conn_id).await;
    send_task.abort();
}
