//! Ingestion endpoints: single/batch upload (multipart), scoped deletion,
//! per-tenant document stats. Temp files are always removed after indexing,
//! success or failure.

use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::models::domain::is_valid_tenant_id;
use crate::models::dto::{
    BatchUploadEntry, BatchUploadResponse, DeleteTenantResponse, DocumentStatsResponse, UploadResponse,
};
use crate::services::ingestion::ProgressEvent;
use crate::state::AppState;
use crate::utils::error::ApiError;

struct UploadedFile {
    file_name: String,
    bytes: Vec<u8>,
}

async fn collect_files(multipart: &mut Multipart, tenant_id: &mut Option<String>) -> Result<Vec<UploadedFile>, ApiError> {
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read multipart field: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "tenant_id" | "tenantId" => {
                *tenant_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(format!("invalid tenant_id: {e}")))?,
                );
            }
            "file" | "files" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read file bytes: {e}")))?
                    .to_vec();
                files.push(UploadedFile { file_name, bytes });
            }
            _ => {}
        }
    }

    Ok(files)
}

/// Writes an upload to a process-local temp path, indexes it, then deletes
/// the temp file regardless of outcome.
async fn index_via_temp_file(
    state: &AppState,
    tenant_id: &str,
    file: UploadedFile,
) -> Result<crate::services::ingestion::IndexOutcome, ApiError> {
    let dir = std::env::temp_dir().join("support-backend-uploads");
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| ApiError::InternalError(format!("failed to create temp upload dir: {e}")))?;
    let temp_path = dir.join(format!("{}-{}", uuid::Uuid::new_v4(), file.file_name));

    tokio::fs::write(&temp_path, &file.bytes)
        .await
        .map_err(|e| ApiError::InternalError(format!("failed to write temp upload file: {e}")))?;

    let on_progress = |_event: ProgressEvent| {};
    let result = state
        .ingestion_core
        .index_document(&temp_path, file.bytes, tenant_id, None, json!({"source": file.file_name}), &on_progress)
        .await;

    if let Err(e) = tokio::fs::remove_file(&temp_path).await {
        warn!(path = %temp_path.display(), error = %e, "failed to clean up temp upload file");
    }

    result
}

pub async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Result<Json<UploadResponse>, ApiError> {
    let mut tenant_id = None;
    let mut files = collect_files(&mut multipart, &mut tenant_id).await?;

    let tenant_id = tenant_id.ok_or_else(|| ApiError::BadRequest("tenant_id is required".to_string()))?;
    if !is_valid_tenant_id(&tenant_id) {
        return Err(ApiError::BadRequest(format!("invalid tenant_id: {tenant_id}")));
    }
    let file = files.pop().ok_or_else(|| ApiError::BadRequest("file is required".to_string()))?;

    let outcome = index_via_temp_file(&state, &tenant_id, file).await?;

    Ok(Json(UploadResponse {
        success: true,
        document_id: outcome.document_id,
        chunks: outcome.chunks,
        skipped: outcome.skipped,
        duration_ms: outcome.duration_ms,
    }))
}

pub async fn batch_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<BatchUploadResponse>, ApiError> {
    let mut tenant_id = None;
    let files = collect_files(&mut multipart, &mut tenant_id).await?;

    let tenant_id = tenant_id.ok_or_else(|| ApiError::BadRequest("tenant_id is required".to_string()))?;
    if !is_valid_tenant_id(&tenant_id) {
        return Err(ApiError::BadRequest(format!("invalid tenant_id: {tenant_id}")));
    }

    let mut results = Vec::with_capacity(files.len());
    for file in files {
        let source_uri = file.file_name.clone();
        match index_via_temp_file(&state, &tenant_id, file).await {
            Ok(outcome) => results.push(BatchUploadEntry {
                source_uri,
                success: true,
                document_id: Some(outcome.document_id),
                chunks: outcome.chunks,
                error: None,
            }),
            Err(e) => results.push(BatchUploadEntry {
                source_uri,
                success: false,
                document_id: None,
                chunks: 0,
                error: Some(e.to_string()),
            }),
        }
    }

    Ok(Json(BatchUploadResponse { results }))
}

#[derive(serde::Deserialize)]
pub struct DeleteDocumentsQuery {
    pub document_id: Option<i64>,
}

pub async fn delete_documents(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(params): Query<DeleteDocumentsQuery>,
) -> Result<Json<DeleteTenantResponse>, ApiError> {
    if !is_valid_tenant_id(&tenant_id) {
        return Err(ApiError::BadRequest(format!("invalid tenant_id: {tenant_id}")));
    }
    state.ingestion_core.delete_documents(&tenant_id, params.document_id).await?;
    Ok(Json(DeleteTenantResponse { deleted: true, tenant_id }))
}

pub async fn stats(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<DocumentStatsResponse>, ApiError> {
    let stats = state.tenant_admin.get_stats(&tenant_id).await?;
    Ok(Json(DocumentStatsResponse {
        tenant_id: stats.tenant_id,
        document_count: stats.document_count,
        collection_name: format!("tenant_{tenant_id}"),
        last_updated: stats.last_updated,
    }))
}
