//! Real-time websocket protocol: one socket per widget/agent client,
//! multiplexing `join_room`/`leave_room` subscriptions onto the
//! `FanoutHub`'s per-room broadcast channels, plus the chat actions a
//! socket caller can trigger in place of the HTTP surface. Delivery to a
//! lagging subscriber is best-effort — a `RecvError::Lagged` just skips
//! ahead, it never closes the socket or drops the underlying message store.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use futures::{SinkExt, StreamExt};
use serde_json::Value as Json;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::models::domain::is_valid_tenant_id;
use crate::services::conversation::TurnOutcome;
use crate::services::fanout::ServerEvent;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ClientEvent {
    JoinRoom { room_id: i64, client_id: String },
    LeaveRoom { room_id: i64, client_id: String },
    Typing { room_id: i64, client_id: String, is_typing: bool },
    #[serde(rename = "widget-message")]
    WidgetMessage { room_id: i64, client_id: String, content: String },
    #[serde(rename = "agent-message")]
    AgentMessage { room_id: i64, client_id: String, agent_id: i64, content: String },
    #[serde(rename = "start-conversation")]
    StartConversation { client_id: String, #[serde(default)] visitor_id: Option<String> },
    #[serde(rename = "end-conversation")]
    EndConversation { room_id: i64, client_id: String },
    #[serde(rename = "get-active-conversations")]
    GetActiveConversations { client_id: String, #[serde(default)] visitor_id: Option<String> },
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ServerFrame {
    RoomJoined { room_id: i64 },
    NewMessage { room_id: i64, sender_type: String, content: String, metadata: Option<Json>, created_at: chrono::DateTime<chrono::Utc> },
    UserTyping { room_id: i64, who: String, is_typing: bool },
    SessionUpdate { room_id: i64, status: String, assigned_agent_id: Option<i64> },
    #[serde(rename = "active-conversations")]
    ActiveConversations { conversations: Vec<Json> },
    Error { message: String },
}

impl From<ServerEvent> for ServerFrame {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::NewMessage { room_id, sender_type, content, metadata, created_at } => {
                ServerFrame::NewMessage { room_id, sender_type, content, metadata, created_at }
            }
            ServerEvent::Typing { room_id, who, is_typing } => ServerFrame::UserTyping { room_id, who, is_typing },
            ServerEvent::SessionUpdate { room_id, status, assigned_agent_id } => {
                ServerFrame::SessionUpdate { room_id, status, assigned_agent_id }
            }
        }
    }
}

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One task per subscribed room, forwarding fan-out events onto the
/// socket's outbound half via an mpsc relay so a single writer owns the
/// websocket sink.
async fn spawn_room_relay(
    mut rx: broadcast::Receiver<ServerEvent>,
    out: tokio::sync::mpsc::UnboundedSender<ServerFrame>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if out.send(event.into()).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("room relay lagged by {n} events, continuing");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<ServerFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut joined: std::collections::HashMap<i64, tokio::task::JoinHandle<()>> = std::collections::HashMap::new();

    while let Some(Ok(msg)) = stream.next().await {
        let WsMessage::Text(text) = msg else { continue };
        let event: ClientEvent = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                let _ = out_tx.send(ServerFrame::Error { message: format!("malformed event: {e}") });
                continue;
            }
        };

        if let Err(e) = dispatch(event, &state, &out_tx, &mut joined).await {
            warn!("realtime dispatch error: {e}");
            let _ = out_tx.send(ServerFrame::Error { message: e.to_string() });
        }
    }

    for (_, handle) in joined.drain() {
        handle.abort();
    }
    writer.abort();
}

async fn dispatch(
    event: ClientEvent,
    state: &AppState,
    out_tx: &tokio::sync::mpsc::UnboundedSender<ServerFrame>,
    joined: &mut std::collections::HashMap<i64, tokio::task::JoinHandle<()>>,
) -> Result<(), crate::utils::error::ApiError> {
    match event {
        ClientEvent::JoinRoom { room_id, client_id } => {
            require_tenant(&client_id)?;
            if let std::collections::hash_map::Entry::Vacant(e) = joined.entry(room_id) {
                let rx = state.fanout.join_room(room_id, &client_id);
                let handle = spawn_room_relay(rx, out_tx.clone()).await;
                e.insert(handle);
            }
            let _ = out_tx.send(ServerFrame::RoomJoined { room_id });
        }
        ClientEvent::LeaveRoom { room_id, .. } => {
            if let Some(handle) = joined.remove(&room_id) {
                handle.abort();
            }
        }
        ClientEvent::Typing { room_id, client_id, is_typing } => {
            require_tenant(&client_id)?;
            state.fanout.publish(room_id, &client_id, ServerEvent::Typing { room_id, who: "customer".to_string(), is_typing });
        }
        ClientEvent::WidgetMessage { room_id, client_id, content } => {
            require_tenant(&client_id)?;
            let outcome = state.conversation_core.process_message(&client_id, room_id, &content).await?;
            if let TurnOutcome::Handover { .. } = outcome {
                // fan-out for the handover path already happened inside
                // `process_message`; nothing further to emit here.
            }
        }
        ClientEvent::AgentMessage { room_id, client_id, agent_id, content } => {
            require_tenant(&client_id)?;
            state.conversation_core.agent_message(&client_id, room_id, agent_id, &content).await?;
        }
        ClientEvent::StartConversation { client_id, visitor_id } => {
            require_tenant(&client_id)?;
            let visitor_id = visitor_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let (room, _messages, _is_new) = state.conversation_core.start_session(&client_id, &visitor_id, None, None).await?;
            let _ = out_tx.send(ServerFrame::RoomJoined { room_id: room.room_id });
        }
        ClientEvent::EndConversation { room_id, client_id } => {
            require_tenant(&client_id)?;
            state.conversation_core.close(&client_id, room_id).await?;
            if let Some(handle) = joined.remove(&room_id) {
                handle.abort();
            }
        }
        ClientEvent::GetActiveConversations { client_id, visitor_id } => {
            require_tenant(&client_id)?;
            let rows = state.conversation_core.conversations(&client_id, visitor_id.as_deref()).await?;
            let conversations: Vec<Json> = rows
                .into_iter()
                .map(|(room, last)| {
                    serde_json::json!({
                        "roomId": room.room_id,
                        "startedAt": room.created_at,
                        "lastMessage": last.as_ref().map(|m| m.content.clone()),
                        "lastMessageAt": last.map(|m| m.created_at).unwrap_or(room.last_activity_at),
                    })
                })
                .collect();
            let _ = out_tx.send(ServerFrame::ActiveConversations { conversations });
        }
    }
    Ok(())
}

fn require_tenant(tenant_id: &str) -> Result<(), crate::utils::error::ApiError> {
    if !is_valid_tenant_id(tenant_id) {
        return Err(crate::utils::error::ApiError::BadRequest(format!("invalid clientId: {tenant_id}")));
    }
    Ok(())
}
