pub mod agents;
pub mod conversation;
pub mod embedding_service;
pub mod extraction;
pub mod fanout;
pub mod handover;
pub mod ingestion;
pub mod llm_service;
pub mod query;
pub mod tenant_admin;

pub use agents::AgentDirectory;
pub use conversation::ConversationCore;
pub use embedding_service::EmbeddingService;
pub use extraction::ExtractionHelper;
pub use fanout::{FanoutHub, SharedFanoutHub};
pub use ingestion::IngestionCore;
pub use llm_service::LlmService;
pub use query::QueryCore;
pub use tenant_admin::TenantAdmin;
