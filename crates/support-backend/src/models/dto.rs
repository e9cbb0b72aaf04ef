//! HTTP request/response bodies for the widget-facing and admin-facing
//! surfaces. Internal components never see these types directly; handlers
//! translate to/from the domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct ApiEnvelope<T: Serialize> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

// ===== /chat/session =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub client_id: String,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub visitor_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub room_id: i64,
    pub messages: Vec<MessageView>,
    pub is_new_session: bool,
    pub session_token: String,
    pub visitor_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub message_id: i64,
    pub sender_type: String,
    pub content: String,
    pub metadata: Option<Json>,
    pub created_at: DateTime<Utc>,
}

// ===== /chat/message =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub client_id: String,
    pub room_id: i64,
    pub content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[serde(untagged)]
pub enum SendMessageResponse {
    Answered {
        message: MessageView,
        sources: Vec<SourceInfo>,
    },
    Handover {
        handover: bool,
        reason: String,
        assigned_agent: Option<AssignedAgentInfo>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignedAgentInfo {
    pub agent_id: i64,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub document_id: i64,
    pub chunk_id: i64,
    pub similarity: f32,
    pub preview: String,
    pub page_number: Option<i32>,
}

// ===== /chat/history =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub client_id: String,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub messages: Vec<MessageView>,
}

// ===== /chat/conversations =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationsQuery {
    #[serde(default)]
    pub visitor_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub room_id: i64,
    pub started_at: DateTime<Utc>,
    pub last_message: Option<String>,
    pub last_message_at: DateTime<Utc>,
}

// ===== /chat/escalate, /chat/close =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalateRequest {
    pub client_id: String,
    pub room_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalateResponse {
    pub assigned: bool,
    pub assigned_agent: Option<AssignedAgentInfo>,
    pub queue_position: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseRequest {
    pub client_id: String,
    pub room_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseResponse {
    pub closed: bool,
}

// ===== /chat/agent/message =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessageRequest {
    pub client_id: String,
    pub room_id: i64,
    pub agent_id: i64,
    pub content: String,
}

// ===== /documents =====

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub document_id: i64,
    pub chunks: usize,
    pub skipped: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUploadResponse {
    pub results: Vec<BatchUploadEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUploadEntry {
    pub source_uri: String,
    pub success: bool,
    pub document_id: Option<i64>,
    pub chunks: usize,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStatsResponse {
    pub tenant_id: String,
    pub document_count: i64,
    pub collection_name: String,
    pub last_updated: Option<DateTime<Utc>>,
}

// ===== /query, /query/stream, /query/semantic-search, /query/hybrid =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub tenant_id: String,
    pub question: String,
    #[serde(default)]
    pub document_ids: Option<Vec<i64>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub text: String,
    pub sources: Vec<SourceInfo>,
    pub confidence: Option<u8>,
    pub usage: Option<UsageInfo>,
    pub latency_ms: u64,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageInfo {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticSearchRequest {
    pub tenant_id: String,
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticSearchResponse {
    pub results: Vec<SemanticSearchHit>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticSearchHit {
    pub document_id: i64,
    pub chunk_id: i64,
    pub text: String,
    pub score: f32,
}

/// SSE frame emitted by `/query/stream`: `data: {"type": "...", ...}`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Token { delta: String },
    Done { sources: Vec<SourceInfo> },
    Error { message: String },
}

// ===== /tenants =====

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantSummary {
    pub tenant_id: String,
    pub document_count: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantListResponse {
    pub tenants: Vec<TenantSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTenantQuery {
    #[serde(default = "default_true")]
    pub confirm: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTenantResponse {
    pub deleted: bool,
    pub tenant_id: String,
}

// ===== /health =====

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub services: HealthServices,
    pub uptime_s: u64,
    pub memory_mb: u64,
    pub environment: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthServices {
    pub vector: bool,
    pub llm: bool,
}
