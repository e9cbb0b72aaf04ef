//! Tenant Admin: tenant listing/stats over the
//! vector store, with a 5-minute TTL cache, plus confirmed tenant deletion.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::database::vector_store::VectorStore;
use crate::models::domain::is_valid_tenant_id;
use crate::utils::error::ApiError;

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct TenantSummary {
    pub tenant_id: String,
    pub document_count: i64,
}

#[derive(Debug, Clone)]
pub struct TenantStats {
    pub tenant_id: String,
    pub document_count: i64,
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
}

struct ListCache {
    tenants: Vec<String>,
    fetched_at: Instant,
}

struct StatsCache {
    count: i64,
    fetched_at: Instant,
}

pub struct TenantAdmin {
    store: Arc<dyn VectorStore>,
    list_cache: RwLock<Option<ListCache>>,
    stats_cache: RwLock<std::collections::HashMap<String, StatsCache>>,
}

impl TenantAdmin {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self { store, list_cache: RwLock::new(None), stats_cache: RwLock::new(std::collections::HashMap::new()) }
    }

    fn check_tenant_id(tenant_id: &str) -> Result<(), ApiError> {
        if !is_valid_tenant_id(tenant_id) {
            return Err(ApiError::BadRequest(format!("invalid tenant_id '{tenant_id}'")));
        }
        Ok(())
    }

    pub async fn list_tenants(&self) -> Result<Vec<TenantSummary>, ApiError> {
        {
            let cache = self.list_cache.read().await;
            if let Some(c) = cache.as_ref() {
                if c.fetched_at.elapsed() < CACHE_TTL {
                    return self.summaries_for(&c.tenants).await;
                }
            }
        }

        let tenants = self.store.list_tenants().await.map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        *self.list_cache.write().await = Some(ListCache { tenants: tenants.clone(), fetched_at: Instant::now() });
        self.summaries_for(&tenants).await
    }

    async fn summaries_for(&self, tenants: &[String]) -> Result<Vec<TenantSummary>, ApiError> {
        let mut out = Vec::with_capacity(tenants.len());
        for tenant_id in tenants {
            let count = self.document_count(tenant_id).await?;
            out.push(TenantSummary { tenant_id: tenant_id.clone(), document_count: count });
        }
        Ok(out)
    }

    async fn document_count(&self, tenant_id: &str) -> Result<i64, ApiError> {
        {
            let cache = self.stats_cache.read().await;
            if let Some(c) = cache.get(tenant_id) {
                if c.fetched_at.elapsed() < CACHE_TTL {
                    return Ok(c.count);
                }
            }
        }

        let count = self.store.count_documents(tenant_id).await.unwrap_or(0);
        self.stats_cache
            .write()
            .await
            .insert(tenant_id.to_string(), StatsCache { count, fetched_at: Instant::now() });
        Ok(count)
    }

    pub async fn get_stats(&self, tenant_id: &str) -> Result<TenantStats, ApiError> {
        Self::check_tenant_id(tenant_id)?;
        let document_count = self.document_count(tenant_id).await?;
        let last_updated = self.store.last_indexed_at(tenant_id).await.unwrap_or(None);
        Ok(TenantStats { tenant_id: tenant_id.to_string(), document_count, last_updated })
    }

    /// Refuses without explicit `confirm`; invalidates both caches on success.
    pub async fn delete_tenant(&self, tenant_id: &str, confirm: bool) -> Result<bool, ApiError> {
        Self::check_tenant_id(tenant_id)?;
        if !confirm {
            return Err(ApiError::Conflict("tenant deletion requires confirm=true".to_string()));
        }

        self.store.delete(tenant_id, None).await.map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        *self.list_cache.write().await = None;
        self.stats_cache.write().await.remove(tenant_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_tenant_id() {
        assert!(TenantAdmin::check_tenant_id("bad/tenant").is_err());
    }

    #[test]
    fn accepts_well_formed_tenant_id() {
        assert!(TenantAdmin::check_tenant_id("acme-1").is_ok());
    }
}
