//! Ingestion Core: dedup/chunk/embed/store pipeline with an on-disk chunk
//! cache and bounded job/embedding concurrency, over the
//! `VectorStore`/`EmbeddingService`/`DocumentParser` gateways.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::RagConfig;
use crate::database::vector_store::VectorStore;
use crate::document::{CaptioningProvider, DocumentParser, TextChunker};
use crate::models::domain::Chunk;
use crate::services::embedding_service::EmbeddingService;
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;

pub const MAX_BYTES: u64 = 50 * 1024 * 1024;
pub const MAX_TEXT_BYTES: u64 = 10 * 1024 * 1024;
const JOB_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Checking,
    Preparing,
    Processing,
    Embedding,
    Storing,
    Complete,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub progress: u8,
}

pub type ProgressCallback<'a> = dyn Fn(ProgressEvent) + Send + Sync + 'a;

#[derive(Debug, Clone, Serialize)]
pub struct IndexOutcome {
    pub skipped: bool,
    pub reason: Option<&'static str>,
    pub document_id: i64,
    pub chunks: usize,
    pub duration_ms: u64,
}

#[derive(Serialize, Deserialize)]
struct ChunkCacheEntry {
    chunks: Vec<String>,
    timestamp: i64,
    count: usize,
}

pub struct IngestionCore {
    store: Arc<dyn VectorStore>,
    embeddings: Arc<EmbeddingService>,
    captioner: Arc<dyn CaptioningProvider>,
    limiters: Arc<Limiters>,
    rag: RagConfig,
    cache_dir: PathBuf,
}

impl IngestionCore {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embeddings: Arc<EmbeddingService>,
        captioner: Arc<dyn CaptioningProvider>,
        limiters: Arc<Limiters>,
        rag: RagConfig,
    ) -> Self {
        let cache_dir = PathBuf::from(&rag.document_path).join("chunk_cache");
        Self { store, embeddings, captioner, limiters, rag, cache_dir }
    }

    fn validate_extension(path: &Path) -> Result<(), ApiError> {
        if !DocumentParser::is_supported(path) {
            return Err(ApiError::BadRequest(format!(
                "unsupported file extension for {}",
                path.display()
            )));
        }
        Ok(())
    }

    fn validate_size(path: &Path, bytes: &[u8]) -> Result<(), ApiError> {
        let ext = DocumentParser::extension_of(path);
        let limit = if matches!(ext.as_str(), "txt" | "md" | "csv") { MAX_TEXT_BYTES } else { MAX_BYTES };
        if bytes.len() as u64 > limit {
            return Err(ApiError::BadRequest(format!(
                "{} exceeds the {} byte limit for its type",
                path.display(),
                limit
            )));
        }
        Ok(())
    }

    fn derive_document_id(tenant_id: &str, source_uri: &str) -> i64 {
        let mut hasher = Sha256::new();
        hasher.update(tenant_id.as_bytes());
        hasher.update(b"|");
        hasher.update(source_uri.as_bytes());
        let digest = hasher.finalize();
        i64::from_be_bytes(digest[0..8].try_into().expect("sha256 digest is >= 8 bytes")).unsigned_abs() as i64
    }

    fn content_hash(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Keyed on `tenant|document_id|chunk_size|chunk_overlap`, hashed with
    /// SHA-256 (already a first-class dependency here) rather than pulling
    /// in a dedicated md5 crate for one cache key.
    fn cache_key(tenant_id: &str, document_id: i64, chunk_size: usize, chunk_overlap: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{tenant_id}|{document_id}|{chunk_size}|{chunk_overlap}").as_bytes());
        hex::encode(hasher.finalize())
    }

    async fn read_cache(&self, key: &str) -> Option<ChunkCacheEntry> {
        let path = self.cache_dir.join(format!("{key}.json"));
        let bytes = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn write_cache(&self, key: &str, chunks: &[String]) {
        if tokio::fs::create_dir_all(&self.cache_dir).await.is_err() {
            return;
        }
        let entry = ChunkCacheEntry { chunks: chunks.to_vec(), timestamp: chrono::Utc::now().timestamp(), count: chunks.len() };
        if let Ok(body) = serde_json::to_vec(&entry) {
            let path = self.cache_dir.join(format!("{key}.json"));
            if let Err(e) = tokio::fs::write(&path, body).await {
                warn!("failed to write chunk cache {key}: {e}");
            }
        }
    }

    pub async fn purge_cache(&self, key: Option<&str>) -> Result<()> {
        match key {
            Some(k) => {
                let _ = tokio::fs::remove_file(self.cache_dir.join(format!("{k}.json"))).await;
            }
            None => {
                let _ = tokio::fs::remove_dir_all(&self.cache_dir).await;
            }
        }
        Ok(())
    }

    pub async fn index_document(
        &self,
        path: &Path,
        bytes: Vec<u8>,
        tenant_id: &str,
        document_id: Option<i64>,
        extra_metadata: Json,
        on_progress: &ProgressCallback<'_>,
    ) -> Result<IndexOutcome, ApiError> {
        let fut = self.index_document_inner(path, bytes, tenant_id, document_id, extra_metadata, on_progress);

        let (_permit, wait) =
            Limiters::acquire_timed(self.limiters.indexing_job.clone(), self.limiters.acquire_timeout, "indexing_job")
                .await
                .map_err(|e| ApiError::Timeout(e.to_string()))?;
        debug!(wait_ms = wait.as_millis() as u64, op = "indexing_job", "wait_queue");

        tokio::time::timeout(JOB_TIMEOUT, fut)
            .await
            .map_err(|_| ApiError::Timeout("indexing job exceeded 300s budget".to_string()))?
    }

    async fn index_document_inner(
        &self,
        path: &Path,
        bytes: Vec<u8>,
        tenant_id: &str,
        document_id: Option<i64>,
        extra_metadata: Json,
        on_progress: &ProgressCallback<'_>,
    ) -> Result<IndexOutcome, ApiError> {
        let start = Instant::now();
        on_progress(ProgressEvent { stage: Stage::Checking, progress: 0 });

        Self::validate_extension(path)?;
        Self::validate_size(path, &bytes)?;

        let source_uri = path.to_string_lossy().to_string();
        let document_id = document_id.unwrap_or_else(|| Self::derive_document_id(tenant_id, &source_uri));

        let already_indexed = self
            .store
            .is_indexed(tenant_id, document_id)
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        if already_indexed {
            on_progress(ProgressEvent { stage: Stage::Complete, progress: 100 });
            return Ok(IndexOutcome {
                skipped: true,
                reason: Some("already_indexed"),
                document_id,
                chunks: 0,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        on_progress(ProgressEvent { stage: Stage::Preparing, progress: 10 });
        let content_hash = Self::content_hash(&bytes);
        let cache_key = Self::cache_key(tenant_id, document_id, self.rag.chunk_size, self.rag.chunk_overlap);

        let (chunk_texts, modality) = if let Some(cached) = self.read_cache(&cache_key).await {
            debug!("chunk cache hit for document {document_id}");
            (cached.chunks, crate::models::domain::Modality::Text)
        } else {
            on_progress(ProgressEvent { stage: Stage::Processing, progress: 25 });
            let parsed = DocumentParser::parse(path, &bytes, self.captioner.as_ref())
                .await
                .map_err(|e| ApiError::BadRequest(format!("failed to parse {}: {e}", path.display())))?;
            let chunker = TextChunker::new(self.rag.chunk_size, self.rag.chunk_overlap);
            let texts = chunker.chunk(&parsed.text);
            self.write_cache(&cache_key, &texts).await;
            (texts, parsed.modality)
        };

        if chunk_texts.is_empty() {
            on_progress(ProgressEvent { stage: Stage::Complete, progress: 100 });
            return Ok(IndexOutcome {
                skipped: true,
                reason: Some("empty_document"),
                document_id,
                chunks: 0,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        on_progress(ProgressEvent { stage: Stage::Embedding, progress: 50 });
        let embeddings = self
            .embeddings
            .embed_batch(chunk_texts.clone())
            .await
            .map_err(|e| ApiError::UpstreamUnavailable(e.to_string()))?;

        let total_chunks = chunk_texts.len() as i32;
        let now = chrono::Utc::now();
        let chunks: Vec<Chunk> = chunk_texts
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (text, embedding))| Chunk {
                chunk_id: 0,
                document_id,
                tenant_id: tenant_id.to_string(),
                text,
                embedding,
                chunk_index: i as i32,
                total_chunks,
                modality: format!("{modality:?}").to_lowercase(),
                source: source_uri.clone(),
                metadata: merge_chunk_metadata(&extra_metadata, i as i32, total_chunks, now),
            })
            .collect();

        on_progress(ProgressEvent { stage: Stage::Storing, progress: 85 });
        self.store.upsert_chunks(&chunks).await.map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        self.store
            .record_document(tenant_id, document_id, &source_uri, &content_hash, extra_metadata)
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        on_progress(ProgressEvent { stage: Stage::Complete, progress: 100 });
        Ok(IndexOutcome {
            skipped: false,
            reason: None,
            document_id,
            chunks: chunks.len(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Indexes every path, continuing past per-file failures; each entry's
    /// outcome (or error) is reported independently: a failed document
    /// never leaves partial chunks behind.
    pub async fn index_multiple(
        &self,
        paths: Vec<(PathBuf, Vec<u8>)>,
        tenant_id: &str,
        extra_metadata: Json,
        on_progress: &ProgressCallback<'_>,
    ) -> Vec<(PathBuf, Result<IndexOutcome, ApiError>)> {
        let mut out = Vec::with_capacity(paths.len());
        for (path, bytes) in paths {
            let result = self.index_document(&path, bytes, tenant_id, None, extra_metadata.clone(), on_progress).await;
            out.push((path, result));
        }
        out
    }

    pub async fn delete_documents(&self, tenant_id: &str, document_id: Option<i64>) -> Result<u64, ApiError> {
        self.store.delete(tenant_id, document_id).await.map_err(|e| ApiError::DatabaseError(e.to_string()))
    }
}

fn merge_chunk_metadata(extra: &Json, chunk_index: i32, total_chunks: i32, processed_at: chrono::DateTime<chrono::Utc>) -> Json {
    let mut map = extra.as_object().cloned().unwrap_or_default();
    map.insert("chunk_index".to_string(), json!(chunk_index));
    map.insert("total_chunks".to_string(), json!(total_chunks));
    map.insert("processed_at".to_string(), json!(processed_at.to_rfc3339()));
    Json::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_stable_for_identical_inputs() {
        let a = IngestionCore::cache_key("acme", 7, 1000, 100);
        let b = IngestionCore::cache_key("acme", 7, 1000, 100);
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_differs_on_chunk_params() {
        let a = IngestionCore::cache_key("acme", 7, 1000, 100);
        let b = IngestionCore::cache_key("acme", 7, 500, 100);
        assert_ne!(a, b);
    }

    #[test]
    fn derived_document_id_is_deterministic() {
        let a = IngestionCore::derive_document_id("acme", "doc.pdf");
        let b = IngestionCore::derive_document_id("acme", "doc.pdf");
        assert_eq!(a, b);
        let c = IngestionCore::derive_document_id("other", "doc.pdf");
        assert_ne!(a, c);
    }

    #[test]
    fn extension_validation_rejects_unsupported_types() {
        assert!(IngestionCore::validate_extension(Path::new("archive.zip")).is_err());
        assert!(IngestionCore::validate_extension(Path::new("note.txt")).is_ok());
    }

    #[test]
    fn size_validation_enforces_text_limit() {
        let big = vec![0u8; (MAX_TEXT_BYTES + 1) as usize];
        assert!(IngestionCore::validate_size(Path::new("note.txt"), &big).is_err());
    }
}
