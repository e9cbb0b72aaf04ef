//! Embedding Gateway: single `embed`, `embed_batch` (chunked by configured
//! batch size, each chunk concurrently embedded under the embedding-batch-
//! group semaphore), and a dimension probe run once at startup.

use crate::config::EmbeddingConfig;
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;
use crate::utils::retry::{retry_with_backoff, RetryPolicy};
use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    input: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Clone)]
pub struct EmbeddingService {
    client: Client,
    base_url: String,
    pub dimension: usize,
    model_name: String,
    cache: Arc<DashMap<String, Vec<f32>>>,
    limiters: Arc<Limiters>,
    batch_size: usize,
    api_key: Option<String>,
}

impl EmbeddingService {
    pub fn new(
        base_url: String,
        config: EmbeddingConfig,
        limiters: Arc<Limiters>,
        batch_size: usize,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url,
            dimension: config.dimension,
            model_name: config.model,
            cache: Arc::new(DashMap::new()),
            limiters,
            batch_size,
            api_key: config.api_key,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ApiError> {
        self.embed_internal(text)
            .await
            .map_err(|e| ApiError::UpstreamUnavailable(e.to_string()))
    }

    async fn embed_internal(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.cache.get(text) {
            debug!("embedding cache hit ({} chars)", text.len());
            return Ok(cached.clone());
        }

        let (_permit, wait) = Limiters::acquire_timed(
            self.limiters.embedding_batch_group.clone(),
            self.limiters.acquire_timeout,
            "embedding",
        )
        .await?;
        debug!(wait_ms = wait.as_millis() as u64, op = "embedding", "wait_queue");

        let exec_start = Instant::now();
        let policy = RetryPolicy::default();
        let embedding = retry_with_backoff(policy, |_: &anyhow::Error| true, || self.call_embed(text)).await?;
        debug!(exec_ms = exec_start.elapsed().as_millis() as u64, op = "embedding", "exec");

        if embedding.len() != self.dimension {
            anyhow::bail!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            );
        }

        self.cache.insert(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    async fn call_embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            input: text.to_string(),
            model: self.model_name.clone(),
        };

        let url = format!("{}/v1/embeddings", self.base_url);
        let mut request_builder = self.client.post(&url);
        if let Some(key) = &self.api_key {
            request_builder = request_builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = request_builder
            .json(&request)
            .send()
            .await
            .context("Failed to connect to embedding server")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding API error ({}): {}", status, body);
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        let embedding = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow::anyhow!("Empty data array returned from embedding server"))?;

        if embedding.is_empty() {
            anyhow::bail!("Generated embedding vector is empty");
        }

        Ok(embedding)
    }

    /// Chunked by `batch_size`; each chunk embeds its texts concurrently
    /// under the shared `embedding_batch_group` semaphore.
    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ApiError> {
        debug!(
            "embedding batch of {} texts (batch_size={})",
            texts.len(),
            self.batch_size
        );

        let mut all_results = Vec::with_capacity(texts.len());
        for group in texts.chunks(self.batch_size) {
            let futures: Vec<_> = group.iter().map(|text| self.embed(text)).collect();
            for result in join_all(futures).await {
                all_results.push(result?);
            }
        }

        Ok(all_results)
    }

    /// Probes the live provider's embedding dimension once at startup and
    /// validates it against the configured `EmbeddingConfig::dimension`.
    pub async fn probe_dimension(&self) -> Result<usize> {
        let embedding = self.call_embed("dimension probe").await?;
        let observed = embedding.len();
        if observed != self.dimension {
            tracing::warn!(
                configured = self.dimension,
                observed,
                "embedding dimension mismatch between config and live provider"
            );
        }
        Ok(observed)
    }
}
