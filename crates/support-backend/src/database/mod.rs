pub mod agent_store;
pub mod pool;
pub mod session_store;
pub mod vector_store;

pub use agent_store::AgentStore;
pub use pool::{connect, DbPool};
pub use session_store::SessionStore;
pub use vector_store::{PgVectorStore, ScoredChunk, VectorStore};
