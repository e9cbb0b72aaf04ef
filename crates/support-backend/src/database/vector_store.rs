//! Vector Store Gateway: tenant-scoped chunk CRUD over Postgres+pgvector,
//! behind a narrow trait so the Query Core and Ingestion Core depend on
//! the trait, not Postgres directly.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde_json::Value as Json;

use crate::database::DbPool;
use crate::models::domain::Chunk;

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
    pub document_id: i64,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Inserts or replaces chunks for `(tenant_id, document_id)`, idempotent
    /// on retry by `(tenant_id, document_id, chunk_index)`.
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<()>;

    async fn search(
        &self,
        tenant_id: &str,
        query_embedding: &[f32],
        top_k: usize,
        document_ids: Option<&[i64]>,
    ) -> Result<Vec<ScoredChunk>>;

    /// True if at least one chunk exists for `(tenant_id, document_id)`.
    async fn is_indexed(&self, tenant_id: &str, document_id: i64) -> Result<bool>;

    /// Deletes chunks for a tenant, optionally scoped to one document.
    async fn delete(&self, tenant_id: &str, document_id: Option<i64>) -> Result<u64>;

    async fn count_documents(&self, tenant_id: &str) -> Result<i64>;

    async fn list_tenants(&self) -> Result<Vec<String>>;

    async fn last_indexed_at(&self, tenant_id: &str) -> Result<Option<DateTime<Utc>>>;

    async fn record_document(
        &self,
        tenant_id: &str,
        document_id: i64,
        source_uri: &str,
        content_hash: &str,
        metadata: Json,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct PgVectorStore {
    pool: DbPool,
}

impl PgVectorStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            let embedding = Vector::from(chunk.embedding.clone());
            sqlx::query(
                r#"INSERT INTO chunks (document_id, tenant_id, text, embedding, chunk_index, total_chunks, modality, source, metadata)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                   ON CONFLICT (tenant_id, document_id, chunk_index) DO UPDATE SET
                     text = EXCLUDED.text,
                     embedding = EXCLUDED.embedding,
                     total_chunks = EXCLUDED.total_chunks,
                     modality = EXCLUDED.modality,
                     source = EXCLUDED.source,
                     metadata = EXCLUDED.metadata"#,
            )
            .bind(chunk.document_id)
            .bind(&chunk.tenant_id)
            .bind(&chunk.text)
            .bind(embedding)
            .bind(chunk.chunk_index)
            .bind(chunk.total_chunks)
            .bind(&chunk.modality)
            .bind(&chunk.source)
            .bind(&chunk.metadata)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn search(
        &self,
        tenant_id: &str,
        query_embedding: &[f32],
        top_k: usize,
        document_ids: Option<&[i64]>,
    ) -> Result<Vec<ScoredChunk>> {
        use sqlx::Row;

        let embedding = Vector::from(query_embedding.to_vec());
        let rows = sqlx::query(
            r#"SELECT chunk_id, document_id, tenant_id, text, chunk_index, total_chunks,
                      modality, source, metadata, 1 - (embedding <=> $1) AS score
               FROM chunks
               WHERE tenant_id = $2 AND ($4::bigint[] IS NULL OR document_id = ANY($4))
               ORDER BY embedding <=> $1
               LIMIT $3"#,
        )
        .bind(embedding)
        .bind(tenant_id)
        .bind(top_k as i64)
        .bind(document_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let document_id: i64 = row.try_get("document_id")?;
            let chunk = Chunk {
                chunk_id: row.try_get("chunk_id")?,
                document_id,
                tenant_id: row.try_get("tenant_id")?,
                text: row.try_get("text")?,
                embedding: Vec::new(),
                chunk_index: row.try_get("chunk_index")?,
                total_chunks: row.try_get("total_chunks")?,
                modality: row.try_get("modality")?,
                source: row.try_get("source")?,
                metadata: row.try_get("metadata")?,
            };
            let score: f64 = row.try_get("score")?;
            out.push(ScoredChunk {
                chunk,
                score: score.clamp(0.0, 1.0) as f32,
                document_id,
            });
        }

        Ok(out)
    }

    async fn is_indexed(&self, tenant_id: &str, document_id: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM chunks WHERE tenant_id = $1 AND document_id = $2",
        )
        .bind(tenant_id)
        .bind(document_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    async fn delete(&self, tenant_id: &str, document_id: Option<i64>) -> Result<u64> {
        let result = match document_id {
            Some(doc_id) => {
                sqlx::query("DELETE FROM chunks WHERE tenant_id = $1 AND document_id = $2")
                    .bind(tenant_id)
                    .bind(doc_id)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM chunks WHERE tenant_id = $1")
                    .bind(tenant_id)
                    .execute(&self.pool)
                    .await?
            }
        };

        if document_id.is_some() {
            sqlx::query("DELETE FROM documents WHERE tenant_id = $1 AND document_id = $2")
                .bind(tenant_id)
                .bind(document_id.unwrap())
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("DELETE FROM documents WHERE tenant_id = $1")
                .bind(tenant_id)
                .execute(&self.pool)
                .await?;
        }

        Ok(result.rows_affected())
    }

    async fn count_documents(&self, tenant_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(DISTINCT document_id) FROM chunks WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn list_tenants(&self) -> Result<Vec<String>> {
        let tenants: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT tenant_id FROM chunks ORDER BY tenant_id")
                .fetch_all(&self.pool)
                .await?;

        Ok(tenants)
    }

    async fn last_indexed_at(&self, tenant_id: &str) -> Result<Option<DateTime<Utc>>> {
        let indexed_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT max(indexed_at) FROM documents WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(indexed_at)
    }

    async fn record_document(
        &self,
        tenant_id: &str,
        document_id: i64,
        source_uri: &str,
        content_hash: &str,
        metadata: Json,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO documents (document_id, tenant_id, source_uri, content_hash, metadata, indexed_at)
               VALUES ($1, $2, $3, $4, $5, now())
               ON CONFLICT (tenant_id, document_id) DO UPDATE SET
                 source_uri = EXCLUDED.source_uri,
                 content_hash = EXCLUDED.content_hash,
                 metadata = EXCLUDED.metadata,
                 indexed_at = now()"#,
        )
        .bind(document_id)
        .bind(tenant_id)
        .bind(source_uri)
        .bind(content_hash)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
