//! Local agent source: `agents` table. Skills are
//! stored as `TEXT[]`; `#[sqlx(skip)]` on `Agent::skills` means rows are
//! assembled manually rather than via `FromRow`.

use anyhow::Result;
use sqlx::Row;

use crate::database::DbPool;
use crate::models::domain::Agent;

#[derive(Clone)]
pub struct AgentStore {
    pool: DbPool,
}

impl AgentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn row_to_agent(row: &sqlx::postgres::PgRow) -> Result<Agent, sqlx::Error> {
        Ok(Agent {
            agent_id: row.try_get("agent_id")?,
            source: row.try_get("source")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            status: row.try_get("status")?,
            max_concurrent: row.try_get("max_concurrent")?,
            current_load: row.try_get("current_load")?,
            department: row.try_get("department")?,
            skills: row.try_get::<Vec<String>, _>("skills").unwrap_or_default(),
        })
    }

    /// Online local agents with spare capacity.
    pub async fn list_available(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query(
            r#"SELECT agent_id, source, name, email, status, max_concurrent, current_load, department, skills
               FROM agents WHERE source = 'local' AND status = 'online' AND current_load < max_concurrent
               ORDER BY agent_id"#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_agent).collect::<Result<_, _>>().map_err(Into::into)
    }

    pub async fn find_by_id(&self, agent_id: i64) -> Result<Option<Agent>> {
        let row = sqlx::query(
            r#"SELECT agent_id, source, name, email, status, max_concurrent, current_load, department, skills
               FROM agents WHERE agent_id = $1"#,
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_agent).transpose().map_err(Into::into)
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<Agent>> {
        let row = sqlx::query(
            r#"SELECT agent_id, source, name, email, status, max_concurrent, current_load, department, skills
               FROM agents WHERE email = $1"#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_agent).transpose().map_err(Into::into)
    }

    /// Creates a local row for an external agent, keyed by email, so the
    /// `rooms.assigned_agent_id` FK holds regardless of agent source.
    pub async fn upsert_external_shadow(
        &self,
        name: &str,
        email: &str,
        max_concurrent: i32,
        department: Option<&str>,
    ) -> Result<Agent> {
        let row = sqlx::query(
            r#"INSERT INTO agents (source, name, email, status, max_concurrent, current_load, department, skills)
               VALUES ('external', $1, $2, 'online', $3, 0, $4, '{}')
               ON CONFLICT (email) DO UPDATE SET name = EXCLUDED.name
               RETURNING agent_id, source, name, email, status, max_concurrent, current_load, department, skills"#,
        )
        .bind(name)
        .bind(email)
        .bind(max_concurrent)
        .bind(department)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_agent(&row).map_err(Into::into)
    }

    pub async fn increment_load(&self, agent_id: i64) -> Result<()> {
        sqlx::query("UPDATE agents SET current_load = current_load + 1 WHERE agent_id = $1")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn decrement_load(&self, agent_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE agents SET current_load = GREATEST(current_load - 1, 0) WHERE agent_id = $1",
        )
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
