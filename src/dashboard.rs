//! Dashboard surfaces: broadcast fan-out, WebSocket endpoint, and the
//! snapshot/detail REST endpoints.
//!
//! The engine publishes a frame after every committed transition and every
//! token update. Fan-out uses a broadcast channel: a subscriber that falls
//! behind drops intermediate updates and resumes with the latest, so
//! observers may skip states but never see an inconsistent one.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;

use crate::server::SharedState;
use crate::store::ConversationSummary;

/// Broadcast capacity; beyond this, slow subscribers lose intermediates.
const CHANNEL_CAPACITY: usize = 256;

/// Fan-out handle for dashboard frames. Cheap to clone; frames are
/// serialized once and shared.
#[derive(Clone)]
pub struct Publisher {
    tx: broadcast::Sender<String>,
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn state_update(&self, summary: &ConversationSummary) {
        self.send(json!({"type": "state_update", "conversation": summary}));
    }

    pub fn api_error(&self, conv_id: &str, status: u16, body: &str) {
        let body: String = body.chars().take(1000).collect();
        self.send(json!({
            "type": "api_error",
            "conv_id": conv_id,
            "status": status,
            "body": body,
        }));
    }

    fn send(&self, frame: serde_json::Value) {
        // Send fails only when nobody is listening.
        let _ = self.tx.send(frame.to_string());
    }
}

/// Commands a dashboard client may send over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DashboardCommand {
    ResetConversation { conv_id: String },
}

/// `GET /dashboard/ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.publisher.subscribe();

    // Initial state before any live frames.
    let conversations = state.store.snapshot().await;
    let initial = json!({"type": "initial_state", "conversations": conversations});
    if sender.send(Message::Text(initial.to_string().into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Ok(frame) => {
                        if sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    // Fell behind: skip to the latest retained frames.
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "dashboard subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<DashboardCommand>(&text) {
                            Ok(DashboardCommand::ResetConversation { conv_id }) => {
                                let count = state.engine.reset_matching(&conv_id, "dashboard").await;
                                tracing::info!(conv_id = %conv_id, count, "dashboard reset");
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "invalid dashboard command");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

/// `GET /dashboard/api/conversations`
pub async fn list_conversations(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let conversations = state.store.snapshot().await;
    Json(json!({"conversations": conversations}))
}

/// `GET /dashboard/api/conversation/{key}`
///
/// The key is either the full `fingerprint:model` key or a prefix of it
/// (including the bare conv_id).
pub async fn conversation_detail(
    Path(key): Path<String>,
    State(state): State<SharedState>,
) -> Response {
    let matches = state.store.find_matching(&key);
    match matches.first() {
        Some(conversation) => {
            let detail = {
                let guard = conversation.lock().await;
                conversation.detail_locked(&guard)
            };
            Json(detail).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "conversation not found"})),
        )
            .into_response(),
    }
}

/// `GET /dashboard`. The front-end ships separately; serve a pointer to the
/// data surfaces instead.
pub async fn dashboard_page() -> Html<&'static str> {
    Html(
        "<!doctype html><title>compaction-proxy</title>\
         <h1>compaction-proxy</h1>\
         <p>Data surfaces: <code>/dashboard/api/conversations</code>, \
         <code>/dashboard/api/conversation/{key}</code>, \
         <code>/dashboard/ws</code></p>",
    )
}
