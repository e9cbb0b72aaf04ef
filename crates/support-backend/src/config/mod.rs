pub mod settings;

pub use settings::{
    AgentsConfig, DatabaseConfig, EmbeddingConfig, ExternalAgentConfig, LimitsConfig, LlmConfig,
    PromptsConfig, RagConfig, SecurityConfig, ServerConfig, Settings,
};
