use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub database: DatabaseConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub rag: RagConfig,
    pub prompts: PromptsConfig,
    pub limits: LimitsConfig,
    pub agents: AgentsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub environment: String,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SecurityConfig {
    pub allowed_ips: Vec<String>,
    pub custom_headers: CustomHeadersConfig,
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CustomHeadersConfig {
    pub app_id: String,
    pub api_key: String,
    pub request_signature: String,
    pub timestamp_tolerance: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub dimension: usize,
    pub batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub max_tokens: usize,
    pub temperature: f32,
    pub stream_response: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RagConfig {
    pub retrieval_top_k: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub rerank_enabled: bool,
    pub max_context_length: usize,
    pub max_context_tokens: usize,
    pub document_path: String,
    pub query_cache_ttl_seconds: u64,
    pub query_cache_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PromptsConfig {
    pub main_system_prompt: String,
    pub context_extraction_system_prompt: String,
}

/// Bounded-concurrency budgets.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LimitsConfig {
    pub indexing_job_concurrency: usize,
    pub embedding_batch_group_concurrency: usize,
    pub db_search_concurrency: usize,
    pub llm_generate_concurrency: usize,
    pub llm_stream_concurrency: usize,
    pub embedding_batch_size: usize,
    pub acquire_timeout_ms: u64,
    pub indexing_job_timeout_seconds: u64,
    pub query_timeout_seconds: u64,
}

impl LimitsConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AgentsConfig {
    pub prefer_local: bool,
    pub skill_based_routing: bool,
    pub queue_timeout_ms: u64,
    pub external: ExternalAgentConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ExternalAgentConfig {
    pub enabled: bool,
    pub db_type: Option<String>,
    pub db_uri: Option<String>,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub table_name: Option<String>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(true))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;
        settings.apply_legacy_env_overrides();
        Ok(settings)
    }

    pub fn config_path(&self) -> PathBuf {
        PathBuf::from("config/settings.toml")
    }

    /// Recognize the flat environment keys
    /// (`CHUNK_SIZE`, `EMBEDDING_BATCH_SIZE`, ...) in addition to the
    /// structured `APP__section__key` overrides already handled by `config`.
    /// Kept separate from the `config` crate's own source chain so the
    /// precedence is explicit: file < APP__ env < these legacy flat keys.
    fn apply_legacy_env_overrides(&mut self) {
        use std::env::var;

        if let Ok(v) = var("DB_URI") {
            self.database.url = v;
        }
        if let Ok(v) = var("PORT") {
            if let Ok(p) = v.parse() {
                self.server.port = p;
            }
        }
        if let Ok(v) = var("CLIENT_URL") {
            self.server.allowed_origins.push(v);
        }
        if let Ok(v) = var("ALLOWED_ORIGINS") {
            self.server.allowed_origins = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = var("LLM_PROVIDER") {
            self.llm.provider = v;
        }
        if let Ok(v) = var("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = var("LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = var("TEMPERATURE") {
            if let Ok(t) = v.parse() {
                self.llm.temperature = t;
            }
        }
        if let Ok(v) = var("MAX_OUTPUT_TOKENS") {
            if let Ok(t) = v.parse() {
                self.llm.max_tokens = t;
            }
        }
        if let Ok(v) = var("EMBEDDING_PROVIDER") {
            self.embedding.provider = v;
        }
        if let Ok(v) = var("EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = var("EMBEDDING_BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                self.limits.embedding_batch_size = n;
            }
        }
        if let Ok(v) = var("CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.rag.chunk_size = n;
            }
        }
        if let Ok(v) = var("CHUNK_OVERLAP") {
            if let Ok(n) = v.parse() {
                self.rag.chunk_overlap = n;
            }
        }
        if let Ok(v) = var("K_DOCUMENTS") {
            if let Ok(n) = v.parse() {
                self.rag.retrieval_top_k = n;
            }
        }
        if let Ok(v) = var("EXTERNAL_AGENT_DB_ENABLED") {
            self.agents.external.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = var("EXTERNAL_AGENT_DB_TYPE") {
            self.agents.external.db_type = Some(v);
        }
        if let Ok(v) = var("EXTERNAL_AGENT_DB_URI") {
            self.agents.external.db_uri = Some(v);
        }
        if let Ok(v) = var("EXTERNAL_AGENT_API_URL") {
            self.agents.external.api_url = Some(v);
        }
        if let Ok(v) = var("EXTERNAL_AGENT_API_KEY") {
            self.agents.external.api_key = Some(v);
        }
        if let Ok(v) = var("EXTERNAL_AGENT_TABLE_NAME") {
            self.agents.external.table_name = Some(v);
        }
        if let Ok(v) = var("PREFER_LOCAL_AGENTS") {
            self.agents.prefer_local = v == "true" || v == "1";
        }
        if let Ok(v) = var("SKILL_BASED_ROUTING") {
            self.agents.skill_based_routing = v == "true" || v == "1";
        }
        if let Ok(v) = var("QUEUE_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                self.agents.queue_timeout_ms = n;
            }
        }
        if let Ok(v) = var("JWT_SECRET") {
            self.security.jwt_secret = Some(v);
        }
        if let Ok(v) = var("LOG_LEVEL") {
            std::env::set_var("RUST_LOG", v);
        }
    }
}
