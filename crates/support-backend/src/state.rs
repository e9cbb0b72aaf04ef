use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Settings;
use crate::database::DbPool;
use crate::logging::ActivityLogger;
use crate::security::{CustomHeaderValidator, IpWhitelist};
use crate::services::{
    AgentDirectory, ConversationCore, EmbeddingService, FanoutHub, IngestionCore, LlmService,
    QueryCore, TenantAdmin,
};
use crate::utils::limiters::Limiters;

/// Application state shared across handlers, wired up once in `main.rs`.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: DbPool,
    pub settings: Settings,
    pub embedding_service: Arc<EmbeddingService>,
    pub llm_service: Arc<LlmService>,
    pub query_core: Arc<QueryCore>,
    pub ingestion_core: Arc<IngestionCore>,
    pub conversation_core: Arc<ConversationCore>,
    pub agent_directory: Arc<AgentDirectory>,
    pub tenant_admin: Arc<TenantAdmin>,
    pub fanout: Arc<FanoutHub>,
    pub activity_logger: Option<ActivityLogger>,
    pub ip_whitelist: Arc<IpWhitelist>,
    pub header_validator: Arc<CustomHeaderValidator>,
    pub limiters: Arc<Limiters>,
    pub started_at: Instant,
}

impl AppState {
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
