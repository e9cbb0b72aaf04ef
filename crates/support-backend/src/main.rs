use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::info;

mod auth;
mod config;
mod database;
mod document;
mod handlers;
mod logging;
mod models;
mod security;
mod services;
mod state;
mod utils;

use config::Settings;
use document::NullCaptioningProvider;
use logging::{ActivityLogger, LoggerConfig};
use security::{CustomHeaderValidator, IpWhitelist};
use services::{
    AgentDirectory, ConversationCore, EmbeddingService, ExtractionHelper, FanoutHub, IngestionCore, LlmService,
    QueryCore, TenantAdmin,
};
use state::AppState;
use utils::limiters::Limiters;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info,support_backend=debug".to_string()))
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .init();

    info!("starting support-backend");

    let settings = Settings::load()?;
    info!("configuration loaded");

    let db_pool = database::connect(&settings.database).await?;
    info!("database connection established");

    let limiters = Arc::new(Limiters::new(&settings.limits));

    let vector_store: Arc<dyn database::VectorStore> = Arc::new(database::PgVectorStore::new(db_pool.clone()));
    let session_store = database::SessionStore::new(db_pool.clone());
    let agent_store = database::AgentStore::new(db_pool.clone());

    let embedding_service = Arc::new(EmbeddingService::new(
        settings.embedding.base_url.clone(),
        settings.embedding.clone(),
        limiters.clone(),
        settings.limits.embedding_batch_size,
    ));

    let llm_service = Arc::new(LlmService::new(settings.llm.clone()));

    let captioner = Arc::new(NullCaptioningProvider);
    let ingestion_core = Arc::new(IngestionCore::new(
        vector_store.clone(),
        embedding_service.clone(),
        captioner,
        limiters.clone(),
        settings.rag.clone(),
    ));

    let query_core = Arc::new(QueryCore::new(
        vector_store.clone(),
        embedding_service.clone(),
        llm_service.clone(),
        settings.prompts.clone(),
        settings.rag.clone(),
        limiters.clone(),
    ));

    let extraction_helper = Arc::new(ExtractionHelper::new(llm_service.clone(), &settings.prompts));
    let agent_directory = Arc::new(AgentDirectory::new(agent_store, settings.agents.clone()));
    let fanout = Arc::new(FanoutHub::new());
    let tenant_admin = Arc::new(TenantAdmin::new(vector_store));

    let activity_logger = Some(ActivityLogger::new(db_pool.clone(), LoggerConfig::default()));

    let conversation_core = Arc::new(ConversationCore::new(
        session_store,
        agent_directory.clone(),
        query_core.clone(),
        extraction_helper,
        fanout.clone(),
        activity_logger.clone(),
    ));

    let ip_whitelist = Arc::new(IpWhitelist::new(settings.config_path(), settings.security.allowed_ips.clone())?);
    (*ip_whitelist).clone().start_watcher()?;
    info!("ip whitelist watcher started");

    let header_validator = Arc::new(CustomHeaderValidator::new(
        settings.security.custom_headers.app_id.clone(),
        settings.security.custom_headers.api_key.clone(),
        settings.security.custom_headers.request_signature == "enabled",
        settings.security.custom_headers.timestamp_tolerance,
    ));

    spawn_queue_sweep(conversation_core.clone());

    let allowed_origins = settings.server.allowed_origins.clone();
    let port = settings.server.port;
    let host = settings.server.host.clone();

    let state = AppState {
        db_pool,
        settings,
        embedding_service,
        llm_service,
        query_core,
        ingestion_core,
        conversation_core,
        agent_directory,
        tenant_admin,
        fanout,
        activity_logger,
        ip_whitelist,
        header_validator,
        limiters,
        started_at: std::time::Instant::now(),
    };

    let app = build_router(state, &allowed_origins);

    let addr = SocketAddr::from((host.parse::<std::net::IpAddr>()?, port));
    info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

/// Periodic sweep dropping queue entries older than `QUEUE_TIMEOUT`.
/// Background sweeps swallow errors after logging rather than surfacing
/// them to any caller.
fn spawn_queue_sweep(conversation_core: Arc<ConversationCore>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let dropped = conversation_core.sweep_expired_queue_entries().await;
            if dropped > 0 {
                info!(dropped, "queue sweep dropped stale entries");
            }
        }
    });
}

fn build_router(state: AppState, allowed_origins: &[String]) -> Router {
    let cors = if allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::permissive().allow_origin(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse::<axum::http::HeaderValue>().ok())
            .collect();
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    };

    let chat_routes = Router::new()
        .route("/chat/session", post(handlers::chat::start_session))
        .route("/chat/message", post(handlers::chat::send_message))
        .route("/chat/history/{room_id}", get(handlers::chat::history))
        .route("/chat/conversations/{client_id}", get(handlers::chat::conversations))
        .route("/chat/escalate", post(handlers::chat::escalate))
        .route("/chat/close", post(handlers::chat::close))
        .route("/chat/agent/message", post(handlers::chat::agent_message));

    let document_routes = Router::new()
        .route("/documents/upload", post(handlers::documents::upload))
        .route("/documents/batch-upload", post(handlers::documents::batch_upload))
        .route("/documents/{tenant_id}", delete(handlers::documents::delete_documents))
        .route("/documents/stats/{tenant_id}", get(handlers::documents::stats))
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024));

    let query_routes = Router::new()
        .route("/query", post(handlers::query::query))
        .route("/query/stream", post(handlers::query::stream_query))
        .route("/query/semantic-search", post(handlers::query::semantic_search))
        .route("/query/hybrid", post(handlers::query::hybrid_query));

    let tenant_routes = Router::new()
        .route("/tenants", get(handlers::tenants::list_tenants))
        .route("/tenants/{tenant_id}", get(handlers::tenants::get_tenant))
        .route("/tenants/{tenant_id}", delete(handlers::tenants::delete_tenant));

    let realtime_routes = Router::new().route("/ws", get(handlers::realtime::ws_upgrade));

    let health_routes = Router::new().route("/health", get(handlers::health::health_check));

    Router::new()
        .merge(health_routes)
        .merge(chat_routes)
        .merge(document_routes)
        .merge(query_routes)
        .merge(tenant_routes)
        .merge(realtime_routes)
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default().include_headers(true)))
        .layer(cors)
        .with_state(state)
}
