use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use crate::config::settings::DatabaseConfig;

pub type DbPool = PgPool;

/// Builds the process-wide Postgres pool per `DatabaseConfig`. Sized via
/// `pool_max_size`; acquiring a connection beyond `pool_timeout_seconds`
/// fails rather than queuing indefinitely.
pub async fn connect(config: &DatabaseConfig) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_max_size)
        .acquire_timeout(Duration::from_secs(config.pool_timeout_seconds))
        .connect(&config.url)
        .await?;

    Ok(pool)
}
