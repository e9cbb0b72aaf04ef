use axum::extract::{Path, Query, State};
use axum::Json;

use crate::models::dto::{
    DeleteTenantQuery, DeleteTenantResponse, DocumentStatsResponse, TenantListResponse, TenantSummary,
};
use crate::state::AppState;
use crate::utils::error::ApiError;

pub async fn list_tenants(State(state): State<AppState>) -> Result<Json<TenantListResponse>, ApiError> {
    let tenants = state
        .tenant_admin
        .list_tenants()
        .await?
        .into_iter()
        .map(|t| TenantSummary { tenant_id: t.tenant_id, document_count: t.document_count })
        .collect();

    Ok(Json(TenantListResponse { tenants }))
}

pub async fn get_tenant(
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

pub async fn delete_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(params): Query<DeleteTenantQuery>,
) -> Result<Json<DeleteTenantResponse>, ApiError> {
    let deleted = state.tenant_admin.delete_tenant(&tenant_id, params.confirm).await?;
    Ok(Json(DeleteTenantResponse { deleted, tenant_id }))
}
