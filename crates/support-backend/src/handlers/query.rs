//! Standalone `/query*` surface: the same Query Core the widget turn uses,
//! exposed directly for server-to-server callers. `hybridQuery` is kept as
//! a distinct route per the external contract but returns vector results —
//! no structured retrieval source exists to merge with (§9 Open Questions).

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::convert::Infallible;

use crate::models::domain::is_valid_tenant_id;
use crate::models::dto::{
    QueryRequest, QueryResponse, SemanticSearchHit, SemanticSearchRequest, SemanticSearchResponse, SourceInfo,
    StreamFrame, UsageInfo,
};
use crate::services::query::QueryOptions;
use crate::state::AppState;
use crate::utils::error::ApiError;

fn require_tenant(tenant_id: &str) -> Result<(), ApiError> {
    if !is_valid_tenant_id(tenant_id) {
        return Err(ApiError::BadRequest(format!("invalid tenant_id: {tenant_id}")));
    }
    Ok(())
}

fn source_info(s: crate::services::query::Source) -> SourceInfo {
    SourceInfo { document_id: s.document_id, chunk_id: s.chunk_id, similarity: s.similarity, preview: s.preview, page_number: None }
}

pub async fn query(State(state): State<AppState>, Json(req): Json<QueryRequest>) -> Result<Json<QueryResponse>, ApiError> {
    require_tenant(&req.tenant_id)?;

    let opts = QueryOptions { history: Vec::new(), collected_entities: HashMap::new(), document_ids: req.document_ids };
    let result = state.query_core.query(&req.tenant_id, &req.question, opts).await?;

    Ok(Json(QueryResponse {
        text: result.text,
        sources: result.sources.into_iter().map(source_info).collect(),
        confidence: result.confidence,
        usage: result.usage.map(|u| UsageInfo { input_tokens: u.input_tokens, output_tokens: u.output_tokens, total_tokens: u.total_tokens }),
        latency_ms: result.latency_ms,
        cached: result.cached,
    }))
}

/// `hybridQuery`: structurally distinct from `/query` per §6, but vector
/// search is the only retrieval source wired in (§9).
pub async fn hybrid_query(state: State<AppState>, req: Json<QueryRequest>) -> Result<Json<QueryResponse>, ApiError> {
    query(state, req).await
}

pub async fn semantic_search(
    State(state): State<AppState>,
    Json(req): Json<SemanticSearchRequest>,
) -> Result<Json<SemanticSearchResponse>, ApiError> {
    require_tenant(&req.tenant_id)?;
    let limit = req.limit.unwrap_or(3);
    let hits = state.query_core.semantic_search(&req.tenant_id, &req.query, limit).await?;

    Ok(Json(SemanticSearchResponse {
        results: hits
            .into_iter()
            .map(|h| SemanticSearchHit { document_id: h.document_id, chunk_id: h.chunk.chunk_id, text: h.chunk.text, score: h.score })
            .collect(),
    }))
}

/// SSE lines `data: {"type": "token"|"done"|"error", ...}`. Closes on
/// stream completion, provider error, or the client disconnecting (axum
/// drops the stream, which drops the underlying provider call).
pub async fn stream_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    require_tenant(&req.tenant_id)?;

    let opts = QueryOptions { history: Vec::new(), collected_entities: HashMap::new(), document_ids: req.document_ids };
    let (token_stream, sources) = state.query_core.stream_query(&req.tenant_id, &req.question, opts).await?;

    let sources: Vec<SourceInfo> = sources.into_iter().map(source_info).collect();

    let frames = async_stream::stream! {
        let mut token_stream = token_stream;
        loop {
            match token_stream.next().await {
                Some(Ok(delta)) => yield StreamFrame::Token { delta },
                Some(Err(e)) => {
                    yield StreamFrame::Error { message: e.to_string() };
                    return;
                }
                None => {
                    yield StreamFrame::Done { sources };
                    return;
                }
            }
        }
    };

    let body = frames.map(|frame| {
        let json = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(json))
    });

    Ok(Sse::new(body))
}
