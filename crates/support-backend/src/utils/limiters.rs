use anyhow::Result;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// The concurrency budgets: ingestion jobs,
/// embedding-batch groups, and the query pipeline. `db_search`/`llm_generate`/
/// `llm_stream` further subdivide the query pipeline's I/O boundaries the
/// way the original embedding/search/generate split already did.
#[derive(Clone)]
pub struct Limiters {
    pub indexing_job: Arc<Semaphore>,
    pub embedding_batch_group: Arc<Semaphore>,
    pub db_search: Arc<Semaphore>,
    pub llm_generate: Arc<Semaphore>,
    pub llm_stream: Arc<Semaphore>,
    pub query: Arc<Semaphore>,
    pub acquire_timeout: Duration,
}

impl Limiters {
    pub fn new(cfg: &crate::config::settings::LimitsConfig) -> Self {
        Self {
            indexing_job: Arc::new(Semaphore::new(cfg.indexing_job_concurrency.max(1))),
            embedding_batch_group: Arc::new(Semaphore::new(
                cfg.embedding_batch_group_concurrency.max(1),
            )),
            db_search: Arc::new(Semaphore::new(cfg.db_search_concurrency.max(1))),
            llm_generate: Arc::new(Semaphore::new(cfg.llm_generate_concurrency.max(1))),
            llm_stream: Arc::new(Semaphore::new(cfg.llm_stream_concurrency.max(1))),
            query: Arc::new(Semaphore::new(cfg.db_search_concurrency.max(1))),
            acquire_timeout: Duration::from_millis(cfg.acquire_timeout_ms.max(1)),
        }
    }

    pub async fn acquire_timed(
        sem: Arc<Semaphore>,
        acquire_timeout: Duration,
        op: &'static str,
    ) -> Result<(OwnedSemaphorePermit, Duration)> {
        let start = Instant::now();

        let permit = tokio::time::timeout(acquire_timeout, sem.acquire_owned())
            .await
            .map_err(|_| anyhow::anyhow!("Limiter acquire timeout for op={}", op))??;

        Ok((permit, start.elapsed()))
    }
}
