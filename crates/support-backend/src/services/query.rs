//! Query Core: classify → retrieve → compose →
//! generate/stream → cache → metrics. A reusable pipeline shared by the
//! widget turn (Conversation Core) and the standalone `/query*` surface.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::config::{PromptsConfig, RagConfig};
use crate::database::vector_store::VectorStore;
use crate::models::domain::Message;
use crate::services::embedding_service::EmbeddingService;
use crate::services::llm_service::{ChatMessage, LlmService, TokenStream};
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;

const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const CACHE_TTL: Duration = Duration::from_secs(30 * 60);
const CACHE_CAPACITY: usize = 1000;
const METRICS_WINDOW: usize = 1000;

static GREETING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(hi|hello|hey|good (morning|afternoon|evening)|greetings)[\s!.,]*$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Greeting,
    Vector,
}

pub fn classify(query: &str) -> Classification {
    if GREETING_RE.is_match(query.trim()) {
        Classification::Greeting
    } else {
        Classification::Vector
    }
}

#[derive(Debug, Clone)]
pub struct Source {
    pub document_id: i64,
    pub chunk_id: i64,
    pub similarity: f32,
    pub preview: String,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub text: String,
    pub sources: Vec<Source>,
    pub confidence: Option<u8>,
    pub usage: Option<crate::services::llm_service::TokenUsage>,
    pub latency_ms: u64,
    pub cached: bool,
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub history: Vec<Message>,
    pub collected_entities: HashMap<String, Json>,
    pub document_ids: Option<Vec<i64>>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self { history: Vec::new(), collected_entities: HashMap::new(), document_ids: None }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryMetricsSnapshot {
    pub total: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
}

#[derive(Default)]
struct MetricsState {
    total: u64,
    cache_hits: u64,
    cache_misses: u64,
    errors: u64,
    samples: VecDeque<u64>,
}

struct CacheEntry {
    result: QueryResult,
    inserted_at: Instant,
}

pub struct QueryCore {
    vector_store: Arc<dyn VectorStore>,
    embeddings: Arc<EmbeddingService>,
    llm: Arc<LlmService>,
    prompts: PromptsConfig,
    rag: RagConfig,
    limiters: Arc<Limiters>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    cache_order: Mutex<VecDeque<String>>,
    metrics: Mutex<MetricsState>,
}

impl QueryCore {
    pub fn new(
        vector_store: Arc<dyn VectorStore>,
        embeddings: Arc<EmbeddingService>,
        llm: Arc<LlmService>,
        prompts: PromptsConfig,
        rag: RagConfig,
        limiters: Arc<Limiters>,
    ) -> Self {
        Self {
            vector_store,
            embeddings,
            llm,
            prompts,
            rag,
            limiters,
            cache: RwLock::new(HashMap::new()),
            cache_order: Mutex::new(VecDeque::new()),
            metrics: Mutex::new(MetricsState::default()),
        }
    }

    /// Hashes `tenant | normalized question | opts_json`, where `opts_json`
    /// covers `document_ids`, `collected_entities` (sorted for a stable
    /// key), and `history` — two turns with the same question text but
    /// different known-customer-data or history must not collide.
    fn cache_key(tenant_id: &str, question: &str, opts: &QueryOptions) -> String {
        let normalized = question.trim().to_lowercase();

        let sorted_entities: std::collections::BTreeMap<&str, &Json> =
            opts.collected_entities.iter().map(|(k, v)| (k.as_str(), v)).collect();

        let mut hasher = Sha256::new();
        hasher.update(tenant_id.as_bytes());
        hasher.update(b"|");
        hasher.update(normalized.as_bytes());
        hasher.update(b"|");
        hasher.update(format!("{:?}", opts.document_ids).as_bytes());
        hasher.update(b"|");
        hasher.update(serde_json::to_string(&sorted_entities).unwrap_or_default().as_bytes());
        hasher.update(b"|");
        hasher.update(serde_json::to_string(&opts.history).unwrap_or_default().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn validate_question(question: &str) -> Result<&str, ApiError> {
        let trimmed = question.trim();
        if trimmed.len() < 3 || trimmed.len() > 1000 {
            return Err(ApiError::BadRequest(format!(
                "question length {} outside [3,1000]",
                trimmed.len()
            )));
        }
        Ok(trimmed)
    }

    async fn record_metrics(&self, outcome: Result<(), ()>, cached: bool, latency_ms: u64) {
        let mut metrics = self.metrics.lock().await;
        metrics.total += 1;
        if cached {
            metrics.cache_hits += 1;
        } else {
            metrics.cache_misses += 1;
        }
        if outcome.is_err() {
            metrics.errors += 1;
        }
        metrics.samples.push_back(latency_ms);
        if metrics.samples.len() > METRICS_WINDOW {
            metrics.samples.pop_front();
        }
    }

    pub async fn metrics_snapshot(&self) -> QueryMetricsSnapshot {
        let metrics = self.metrics.lock().await;
        let avg = if metrics.samples.is_empty() {
            0.0
        } else {
            metrics.samples.iter().sum::<u64>() as f64 / metrics.samples.len() as f64
        };
        QueryMetricsSnapshot {
            total: metrics.total,
            cache_hits: metrics.cache_hits,
            cache_misses: metrics.cache_misses,
            errors: metrics.errors,
            avg_latency_ms: avg,
        }
    }

    async fn cache_get(&self, key: &str) -> Option<QueryResult> {
        let cache = self.cache.read().await;
        cache.get(key).filter(|e| e.inserted_at.elapsed() < CACHE_TTL).map(|e| {
            let mut r = e.result.clone();
            r.cached = true;
            r
        })
    }

    async fn cache_put(&self, key: String, result: QueryResult) {
        let mut cache = self.cache.write().await;
        let mut order = self.cache_order.lock().await;

        if !cache.contains_key(&key) {
            order.push_back(key.clone());
        }
        cache.insert(key, CacheEntry { result, inserted_at: Instant::now() });

        while cache.len() > CACHE_CAPACITY {
            if let Some(oldest) = order.pop_front() {
                cache.remove(&oldest);
            } else {
                break;
            }
        }
    }

    fn compose_prompt(&self, question: &str, context_chunks: &[String], opts: &QueryOptions) -> Vec<ChatMessage> {
        let mut sections = Vec::new();

        if !opts.collected_entities.is_empty() {
            let known: Vec<String> = opts
                .collected_entities
                .iter()
                .filter(|(k, _)| *k != "pendingHandover" && *k != "handoverReason")
                .map(|(k, v)| format!("{k}: {}", v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())))
                .collect();
            if !known.is_empty() {
                sections.push(format!("Known customer data:\n{}", known.join("\n")));
            }
        }

        if !context_chunks.is_empty() {
            sections.push(format!("Knowledge base context:\n{}", context_chunks.join("\n\n---\n\n")));
        }

        if !opts.history.is_empty() {
            let history: Vec<String> = opts
                .history
                .iter()
                .rev()
                .take(10)
                .rev()
                .map(|m| {
                    let label = if m.sender_type == "customer" { "Customer" } else { "Agent" };
                    format!("{label}: {}", m.content)
                })
                .collect();
            sections.push(format!("Conversation history:\n{}", history.join("\n")));
        }

        sections.push(format!("Current question:\n{question}"));
        sections.push(
            "Rules: never invent account details or IDs; do not re-ask for information already present in known customer data; try to resolve the question before suggesting escalation.".to_string(),
        );

        vec![ChatMessage::system(self.prompts.main_system_prompt.clone()), ChatMessage::user(sections.join("\n\n"))]
    }

    async fn retrieve(&self, tenant_id: &str, question: &str, document_ids: Option<&[i64]>) -> Result<Vec<crate::database::vector_store::ScoredChunk>, ApiError> {
        let (_permit, _wait) =
            Limiters::acquire_timed(self.limiters.db_search.clone(), self.limiters.acquire_timeout, "db_search")
                .await
                .map_err(|e| ApiError::Timeout(e.to_string()))?;

        let embedding = self.embeddings.embed(question).await?;
        self.vector_store
            .search(tenant_id, &embedding, self.rag.retrieval_top_k, document_ids)
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))
    }

    pub async fn query(&self, tenant_id: &str, question: &str, opts: QueryOptions) -> Result<QueryResult, ApiError> {
        let fut = self.query_inner(tenant_id, question, opts);
        tokio::time::timeout(QUERY_TIMEOUT, fut).await.map_err(|_| {
            ApiError::Timeout("query exceeded 30s budget".to_string())
        })?
    }

    async fn query_inner(&self, tenant_id: &str, question: &str, opts: QueryOptions) -> Result<QueryResult, ApiError> {
        let start = Instant::now();
        let question = Self::validate_question(question)?;

        let (_permit, _wait) =
            Limiters::acquire_timed(self.limiters.query.clone(), self.limiters.acquire_timeout, "query")
                .await
                .map_err(|e| ApiError::Timeout(e.to_string()))?;

        let key = Self::cache_key(tenant_id, question, &opts);
        if let Some(cached) = self.cache_get(&key).await {
            self.record_metrics(Ok(()), true, start.elapsed().as_millis() as u64).await;
            return Ok(cached);
        }

        if classify(question) == Classification::Greeting {
            let result = QueryResult {
                text: "Hello! How can I help you today?".to_string(),
                sources: Vec::new(),
                confidence: None,
                usage: None,
                latency_ms: start.elapsed().as_millis() as u64,
                cached: false,
            };
            self.cache_put(key, result.clone()).await;
            self.record_metrics(Ok(()), false, result.latency_ms).await;
            return Ok(result);
        }

        let hits = self.retrieve(tenant_id, question, opts.document_ids.as_deref()).await;
        let hits = match hits {
            Ok(h) => h,
            Err(e) => {
                self.record_metrics(Err(()), false, start.elapsed().as_millis() as u64).await;
                return Err(e);
            }
        };

        let context_chunks: Vec<String> = hits.iter().map(|h| h.chunk.text.clone()).collect();
        let confidence = hits.iter().map(|h| h.score).fold(None, |acc: Option<f32>, s| Some(acc.map_or(s, |a| a.max(s))));
        let confidence = confidence.map(|s| (s * 100.0).round() as u8);

        let messages = self.compose_prompt(question, &context_chunks, &opts);

        let (_gen_permit, _gen_wait) =
            Limiters::acquire_timed(self.limiters.llm_generate.clone(), self.limiters.acquire_timeout, "llm_generate")
                .await
                .map_err(|e| ApiError::Timeout(e.to_string()))?;

        let response = match self.llm.generate(messages).await {
            Ok(r) => r,
            Err(e) => {
                self.record_metrics(Err(()), false, start.elapsed().as_millis() as u64).await;
                return Err(e);
            }
        };

        let sources: Vec<Source> = hits
            .into_iter()
            .map(|h| Source {
                document_id: h.document_id,
                chunk_id: h.chunk.chunk_id,
                similarity: h.score,
                preview: h.chunk.text.chars().take(200).collect(),
            })
            .collect();

        let result = QueryResult {
            text: response.text,
            sources,
            confidence,
            usage: Some(response.usage),
            latency_ms: start.elapsed().as_millis() as u64,
            cached: false,
        };

        self.cache_put(key, result.clone()).await;
        self.record_metrics(Ok(()), false, result.latency_ms).await;
        Ok(result)
    }

    /// Streaming bypasses the answer cache entirely (§4.2).
    pub async fn stream_query(&self, tenant_id: &str, question: &str, opts: QueryOptions) -> Result<(TokenStream, Vec<Source>), ApiError> {
        let question = Self::validate_question(question)?;

        let (_permit, _wait) =
            Limiters::acquire_timed(self.limiters.llm_stream.clone(), self.limiters.acquire_timeout, "llm_stream")
                .await
                .map_err(|e| ApiError::Timeout(e.to_string()))?;

        if classify(question) == Classification::Greeting {
            let stream: TokenStream = Box::pin(futures::stream::once(async { Ok("Hello! How can I help you today?".to_string()) }));
            return Ok((stream, Vec::new()));
        }

        let hits = self.retrieve(tenant_id, question, opts.document_ids.as_deref()).await?;
        let context_chunks: Vec<String> = hits.iter().map(|h| h.chunk.text.clone()).collect();
        let sources: Vec<Source> = hits
            .iter()
            .map(|h| Source {
                document_id: h.document_id,
                chunk_id: h.chunk.chunk_id,
                similarity: h.score,
                preview: h.chunk.text.chars().take(200).collect(),
            })
            .collect();

        let messages = self.compose_prompt(question, &context_chunks, &opts);
        let stream = self.llm.generate_stream(messages).await?;
        Ok((stream, sources))
    }

    pub async fn semantic_search(&self, tenant_id: &str, query: &str, limit: usize) -> Result<Vec<crate::database::vector_store::ScoredChunk>, ApiError> {
        let limit = limit.clamp(1, 50);
        let (_permit, _wait) =
            Limiters::acquire_timed(self.limiters.db_search.clone(), self.limiters.acquire_timeout, "db_search")
                .await
                .map_err(|e| ApiError::Timeout(e.to_string()))?;

        let embedding = self.embeddings.embed(query).await?;
        self.vector_store
            .search(tenant_id, &embedding, limit, None)
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_bare_greetings() {
        assert_eq!(classify("hello!"), Classification::Greeting);
        assert_eq!(classify("Hi"), Classification::Greeting);
    }

    #[test]
    fn classifies_substantive_question_as_vector() {
        assert_eq!(classify("what is your refund window?"), Classification::Vector);
    }

    #[test]
    fn rejects_too_short_question() {
        assert!(QueryCore::validate_question("hi").is_err());
    }

    #[test]
    fn rejects_too_long_question() {
        let long = "a".repeat(1001);
        assert!(QueryCore::validate_question(&long).is_err());
    }

    #[test]
    fn accepts_boundary_lengths() {
        assert!(QueryCore::validate_question("abc").is_ok());
    }

    #[test]
    fn cache_key_ignores_case_and_whitespace() {
        let opts = QueryOptions::default();
        let a = QueryCore::cache_key("acme", "  What Is This? ", &opts);
        let b = QueryCore::cache_key("acme", "what is this?", &opts);
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_is_tenant_scoped() {
        let opts = QueryOptions::default();
        let a = QueryCore::cache_key("acme", "same question", &opts);
        let b = QueryCore::cache_key("globex", "same question", &opts);
        assert_ne!(a, b);
    }

    #[test]
    fn cache_key_varies_with_known_customer_data() {
        let without_identity = QueryOptions::default();
        let mut with_identity = QueryOptions::default();
        with_identity.collected_entities.insert("email".to_string(), Json::String("jane@x.co".to_string()));

        let a = QueryCore::cache_key("acme", "what's my balance?", &without_identity);
        let b = QueryCore::cache_key("acme", "what's my balance?", &with_identity);
        assert_ne!(a, b, "two turns with different known customer data must not share a cache entry");
    }
}
