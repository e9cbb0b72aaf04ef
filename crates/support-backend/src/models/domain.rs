//! Core data model: Tenant, Document, Chunk, Room, Message, SessionContext,
//! Agent, QueueEntry, and the Postgres mapping these types round-trip
//! through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sqlx::FromRow;
use std::collections::HashMap;

pub type TenantId = String;

/// `[A-Za-z0-9_-]{1,100}`.
pub fn is_valid_tenant_id(tenant_id: &str) -> bool {
    !tenant_id.is_empty()
        && tenant_id.len() <= 100
        && tenant_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Document {
    pub document_id: i64,
    pub tenant_id: TenantId,
    pub source_uri: String,
    pub content_hash: String,
    pub metadata: Json,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
    Audio,
}

impl Default for Modality {
    fn default() -> Self {
        Modality::Text
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Chunk {
    pub chunk_id: i64,
    pub document_id: i64,
    pub tenant_id: TenantId,
    pub text: String,
    #[sqlx(skip)]
    pub embedding: Vec<f32>,
    pub chunk_index: i32,
    pub total_chunks: i32,
    pub modality: String,
    pub source: String,
    pub metadata: Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentSourceKind {
    Local,
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Room {
    pub room_id: i64,
    pub tenant_id: TenantId,
    pub session_token: String,
    pub visitor_id: String,
    pub status: String,
    pub assigned_agent_id: Option<i64>,
    pub agent_source: Option<String>,
    pub takeover: bool,
    pub customer_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Room {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned_agent_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    Customer,
    Ai,
    Agent,
    System,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::Customer => "customer",
            SenderType::Ai => "ai",
            SenderType::Agent => "agent",
            SenderType::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub message_id: i64,
    pub room_id: i64,
    pub tenant_id: TenantId,
    pub sender_type: String,
    pub content: String,
    pub metadata: Option<Json>,
    pub created_at: DateTime<Utc>,
    pub sender_id: Option<i64>,
}

/// One-to-one with [`Room`]. `collected_entities` is monotonic across a
/// session except for the internal `pendingHandover` / `handoverReason`
/// flags, which are cleared once a handover resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub room_id: i64,
    pub tenant_id: TenantId,
    pub collected_entities: HashMap<String, Json>,
    pub current_workflow: Option<String>,
    pub workflow_state: HashMap<String, Json>,
    pub updated_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(room_id: i64, tenant_id: TenantId) -> Self {
        Self {
            room_id,
            tenant_id,
            collected_entities: HashMap::new(),
            current_workflow: None,
            workflow_state: HashMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn has_identity(&self) -> bool {
        ["email", "name", "phone"]
            .iter()
            .any(|k| self.collected_entities.contains_key(*k))
    }

    pub fn pending_handover(&self) -> Option<String> {
        if self
            .collected_entities
            .get("pendingHandover")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            self.collected_entities
                .get("handoverReason")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .or_else(|| Some("unspecified".to_string()))
        } else {
            None
        }
    }

    pub fn set_pending_handover(&mut self, reason: &str) {
        self.collected_entities
            .insert("pendingHandover".to_string(), Json::Bool(true));
        self.collected_entities
            .insert("handoverReason".to_string(), Json::String(reason.to_string()));
    }

    pub fn clear_pending_handover(&mut self) {
        self.collected_entities.remove("pendingHandover");
        self.collected_entities.remove("handoverReason");
    }

    /// Monotonic merge: existing keys are overwritten, never dropped.
    pub fn merge_entities(&mut self, new_entities: HashMap<String, Json>) {
        for (k, v) in new_entities {
            self.collected_entities.insert(k, v);
        }
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    Busy,
    Away,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub agent_id: i64,
    pub source: String,
    pub name: String,
    pub email: String,
    pub status: String,
    pub max_concurrent: i32,
    pub current_load: i32,
    pub department: Option<String>,
    #[sqlx(skip)]
    pub skills: Vec<String>,
}

impl Agent {
    pub fn has_capacity(&self) -> bool {
        self.status == "online" && self.current_load < self.max_concurrent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Vip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub tenant_id: TenantId,
    pub room_id: i64,
    pub priority: Priority,
    pub department: Option<String>,
    pub required_skills: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
    pub customer_info: HashMap<String, Json>,
}
