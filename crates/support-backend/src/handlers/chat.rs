//! Widget- and agent-facing chat endpoints: session bootstrap, turns,
//! history, escalation and closing. `clientId` in the wire format is this
//! system's `tenant_id`.

use axum::extract::{Path, Query, State};
use axum::Json;

use crate::models::domain::{is_valid_tenant_id, Room};
use crate::models::dto::{
    AssignedAgentInfo, CloseRequest, CloseResponse, ConversationSummary, ConversationsQuery,
    EscalateRequest, EscalateResponse, HistoryQuery, HistoryResponse, MessageView,
    SendMessageRequest, SendMessageResponse, SourceInfo, StartSessionRequest, StartSessionResponse,
};
use crate::services::conversation::TurnOutcome;
use crate::state::AppState;
use crate::utils::error::ApiError;

fn require_tenant(tenant_id: &str) -> Result<(), ApiError> {
    if !is_valid_tenant_id(tenant_id) {
        return Err(ApiError::BadRequest(format!("invalid clientId: {tenant_id}")));
    }
    Ok(())
}

fn message_view(m: crate::models::domain::Message) -> MessageView {
    MessageView {
        message_id: m.message_id,
        sender_type: m.sender_type,
        content: m.content,
        metadata: m.metadata,
        created_at: m.created_at,
    }
}

pub async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartSessionRequest>,
) -> Result<Json<StartSessionResponse>, ApiError> {
    require_tenant(&req.client_id)?;
    let visitor_id = req.visitor_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let (room, messages, is_new_session) = state
        .conversation_core
        .start_session(&req.client_id, &visitor_id, req.session_token, req.room_id)
        .await?;

    Ok(Json(StartSessionResponse {
        room_id: room.room_id,
        messages: messages.into_iter().map(message_view).collect(),
        is_new_session,
        session_token: room.session_token,
        visitor_id: room.visitor_id,
    }))
}

pub async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    require_tenant(&req.client_id)?;

    let outcome = state
        .conversation_core
        .process_message(&req.client_id, req.room_id, &req.content)
        .await?;

    let response = match outcome {
        TurnOutcome::Answered { message, sources } => SendMessageResponse::Answered {
            message: message_view(message),
            sources: sources
                .into_iter()
                .map(|s| SourceInfo {
                    document_id: s.document_id,
                    chunk_id: s.chunk_id,
                    similarity: s.similarity,
                    preview: s.preview,
                    page_number: None,
                })
                .collect(),
        },
        TurnOutcome::Handover { reason, assigned_agent } => SendMessageResponse::Handover {
            handover: true,
            reason,
            assigned_agent: assigned_agent.map(|a| AssignedAgentInfo {
                agent_id: a.agent_id,
                name: a.name,
                email: a.email,
            }),
        },
    };

    Ok(Json(response))
}

pub async fn history(
    State(state): State<AppState>,
    Path(room_id): Path<i64>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    require_tenant(&params.client_id)?;
    let limit = params.limit.unwrap_or(50);
    let messages = state.conversation_core.history(&params.client_id, room_id, limit).await?;
    Ok(Json(HistoryResponse { messages: messages.into_iter().map(message_view).collect() }))
}

pub async fn conversations(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Query(params): Query<ConversationsQuery>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    require_tenant(&client_id)?;
    let rows = state.conversation_core.conversations(&client_id, params.visitor_id.as_deref()).await?;

    let summaries = rows
        .into_iter()
        .map(|(room, last): (Room, _)| ConversationSummary {
            room_id: room.room_id,
            started_at: room.created_at,
            last_message: last.as_ref().map(|m| m.content.clone()),
            last_message_at: last.map(|m| m.created_at).unwrap_or(room.last_activity_at),
        })
        .collect();

    Ok(Json(summaries))
}

pub async fn escalate(
    State(state): State<AppState>,
    Json(req): Json<EscalateRequest>,
) -> Result<Json<EscalateResponse>, ApiError> {
    require_tenant(&req.client_id)?;
    let (assigned_agent, queue_position) = state.conversation_core.escalate(&req.client_id, req.room_id).await?;

    Ok(Json(EscalateResponse {
        assigned: assigned_agent.is_some(),
        assigned_agent: assigned_agent.map(|a| AssignedAgentInfo { agent_id: a.agent_id, name: a.name, email: a.email }),
        queue_position,
    }))
}

pub async fn close(
    State(state): State<AppState>,
    Json(req): Json<CloseRequest>,
) -> Result<Json<CloseResponse>, ApiError> {
    require_tenant(&req.client_id)?;
    let closed = state.conversation_core.close(&req.client_id, req.room_id).await?;
    Ok(Json(CloseResponse { closed }))
}

pub async fn agent_message(
    State(state): State<AppState>,
    Json(req): Json<crate::models::dto::AgentMessageRequest>,
) -> Result<Json<MessageView>, ApiError> {
    require_tenant(&req.client_id)?;
    let message = state
        .conversation_core
        .agent_message(&req.client_id, req.room_id, req.agent_id, &req.content)
        .await?;
    Ok(Json(message_view(message)))
}
