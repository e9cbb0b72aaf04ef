use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use sysinfo::System;

use crate::models::dto::{HealthResponse, HealthServices};
use crate::state::AppState;

/// Process RSS, in megabytes, via a one-shot `sysinfo` refresh.
fn current_memory_mb() -> u64 {
    let mut sys = System::new_all();
    sys.refresh_all();
    let pid = sysinfo::get_current_pid().ok();
    let rss_bytes = pid.and_then(|pid| sys.process(pid)).map(|p| p.memory()).unwrap_or(0);
    rss_bytes / (1024 * 1024)
}

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let vector_ok = sqlx::query("SELECT 1").fetch_one(&state.db_pool).await.is_ok();
    let llm_ok = state.llm_service.is_configured();

    let healthy = vector_ok && llm_ok;
    let status = if healthy { "healthy" } else { "degraded" };
    let code = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    let body = HealthResponse {
        status: status.to_string(),
        services: HealthServices { vector: vector_ok, llm: llm_ok },
        uptime_s: state.uptime().as_secs(),
        memory_mb: current_memory_mb(),
        environment: state.settings.server.environment.clone(),
    };

    (code, Json(body))
}
