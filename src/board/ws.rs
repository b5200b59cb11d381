use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::api::{ApiError, SharedState};
use super::auth::CurrentUser;
use super::models::{Conversation, Message as ChatMessage, TaskDocument};
use super::workspaces::require_member;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum WsMessage {
    TaskCreated { task: TaskDocument },
    TaskUpdated { task: TaskDocument },
    TaskDeleted { task_id: String },
    ConversationCreated { conversation: Conversation },
    MessageSent { message: ChatMessage },
}

/// A serialized event and who may see it.
///
/// Every event belongs to a workspace. Chat events additionally carry the
/// conversation's member ids; other subscribers never receive them.
#[derive(Debug, Clone)]
pub struct BoardEvent {
    pub workspace_id: String,
    pub audience: Option<Vec<String>>,
    pub payload: String,
}

impl BoardEvent {
    pub fn visible_to(&self, workspace_id: &str, user_id: &str) -> bool {
        self.workspace_id == workspace_id
            && self
                .audience
                .as_ref()
                .is_none_or(|users| users.iter().any(|u| u == user_id))
    }
}

/// Serialize and publish an event. Having no subscribers is not an error.
pub fn broadcast_message(
    tx: &broadcast::Sender<BoardEvent>,
    workspace_id: &str,
    audience: Option<Vec<String>>,
    msg: &WsMessage,
) {
    match serde_json::to_string(msg) {
        Ok(payload) => {
            let _ = tx.send(BoardEvent {
                workspace_id: workspace_id.to_string(),
                audience,
                payload,
            });
        }
        Err(e) => warn!(error = %e, "Failed to serialize board event"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeParams {
    pub workspace_id: Option<String>,
}

/// `GET /api/ws?workspaceId=…&token=…`: subscribe to a workspace's events.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(params): Query<SubscribeParams>,
    current: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let workspace_id = params
        .workspace_id
        .filter(|w| !w.is_empty())
        .ok_or_else(|| ApiError::BadRequest("workspaceId is required".into()))?;
    let user_id = current.user.id.clone();
    {
        let (ws_id, uid) = (workspace_id.clone(), user_id.clone());
        state.db.run(move |db| require_member(db, &ws_id, &uid)).await?;
    }

    let rx = state.events.subscribe();
    debug!(workspace_id = %workspace_id, user_id = %user_id, "WebSocket subscribed");
    Ok(ws.on_upgrade(move |socket| {
        let (sender, receiver) = socket.split();
        run_socket_loop(sender, receiver, rx, workspace_id, user_id)
    }))
}

async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<BoardEvent>,
    workspace_id: String,
    user_id: String,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!(user_id = %user_id, "WebSocket pong timeout");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !event.visible_to(&workspace_id, &user_id) {
                            continue;
                        }
                        if sender.send(Message::Text(event.payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket subscriber lagged");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}
