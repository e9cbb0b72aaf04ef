//! Real-time Fan-out: a lightweight per-room pub/sub
//! plus an external-agent bridge channel. Rooms are addressed by
//! `room_<room_id>_<tenant_id>`; delivery is best-effort — a lagging
//! websocket subscriber never blocks or drops the underlying message store.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value as Json;
use std::sync::Arc;
use tokio::sync::broadcast;

const ROOM_CHANNEL_CAPACITY: usize = 256;
const BRIDGE_CHANNEL_CAPACITY: usize = 256;

pub fn room_topic(room_id: i64, tenant_id: &str) -> String {
    format!("room_{room_id}_{tenant_id}")
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage { room_id: i64, sender_type: String, content: String, metadata: Option<Json>, created_at: DateTime<Utc> },
    Typing { room_id: i64, who: String, is_typing: bool },
    SessionUpdate { room_id: i64, status: String, assigned_agent_id: Option<i64> },
}

/// Outbound payload to the external agent backend: the bridge's enriched
/// `widget_message` shape.
#[derive(Debug, Clone, Serialize)]
pub struct WidgetMessagePayload {
    pub id: i64,
    pub conversation_id: i64,
    pub client_id: String,
    pub content: String,
    pub sender_type: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<Json>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub topic: Option<String>,
    pub status: String,
    pub takeover: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentAssignedPayload {
    pub agent_email: String,
    pub agent_name: String,
    pub room_id: i64,
    pub client_id: String,
    pub customer_email: Option<String>,
}

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    WidgetMessage(WidgetMessagePayload),
    AgentAssigned(AgentAssignedPayload),
}

/// Per-room `broadcast` channels created lazily on first `join_room`, plus
/// one outbound bridge channel shared across all rooms.
pub struct FanoutHub {
    rooms: DashMap<String, broadcast::Sender<ServerEvent>>,
    bridge_out: broadcast::Sender<BridgeEvent>,
}

impl FanoutHub {
    pub fn new() -> Self {
        let (bridge_out, _) = broadcast::channel(BRIDGE_CHANNEL_CAPACITY);
        Self { rooms: DashMap::new(), bridge_out }
    }

    fn sender_for(&self, room_id: i64, tenant_id: &str) -> broadcast::Sender<ServerEvent> {
        let topic = room_topic(room_id, tenant_id);
        self.rooms
            .entry(topic)
            .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn join_room(&self, room_id: i64, tenant_id: &str) -> broadcast::Receiver<ServerEvent> {
        self.sender_for(room_id, tenant_id).subscribe()
    }

    /// Best-effort: `send` only fails when there are zero subscribers, which
    /// is not an error for a fire-and-forget event.
    pub fn publish(&self, room_id: i64, tenant_id: &str, event: ServerEvent) {
        let _ = self.sender_for(room_id, tenant_id).send(event);
    }

    pub fn subscribe_bridge(&self) -> broadcast::Receiver<BridgeEvent> {
        self.bridge_out.subscribe()
    }

    pub fn publish_bridge(&self, event: BridgeEvent) {
        let _ = self.bridge_out.send(event);
    }
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedFanoutHub = Arc<FanoutHub>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_topic_has_expected_shape() {
        assert_eq!(room_topic(42, "acme"), "room_42_acme");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let hub = FanoutHub::new();
        hub.publish(1, "acme", ServerEvent::Typing { room_id: 1, who: "ai".to_string(), is_typing: true });
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let hub = FanoutHub::new();
        let mut rx = hub.join_room(1, "acme");
        hub.publish(1, "acme", ServerEvent::Typing { room_id: 1, who: "ai".to_string(), is_typing: false });
        let event = rx.recv().await.unwrap();
        matches!(event, ServerEvent::Typing { .. });
    }
}
