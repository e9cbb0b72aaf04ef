//! Rooms, messages and session contexts: the durable side of a conversation.
//! Maps onto `rooms`, `messages`, `session_contexts`.
//! Assumes the schema already exists (no migrations are run by this crate).

use anyhow::Result;
use chrono::Utc;
use serde_json::Value as Json;
use std::collections::HashMap;

use crate::database::DbPool;
use crate::models::domain::{Message, Room, SessionContext, TenantId};

#[derive(Clone)]
pub struct SessionStore {
    pool: DbPool,
}

impl SessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Finds the single active room for `(tenant_id, visitor_id)`, if any.
    pub async fn find_active_room(
        &self,
        tenant_id: &str,
        visitor_id: &str,
    ) -> Result<Option<Room>> {
        let room = sqlx::query_as::<_, Room>(
            r#"SELECT room_id, tenant_id, session_token, visitor_id, status,
                      assigned_agent_id, agent_source, takeover, customer_email,
                      created_at, last_activity_at, closed_at
               FROM rooms
               WHERE tenant_id = $1 AND visitor_id = $2 AND status = 'active'
               ORDER BY created_at DESC
               LIMIT 1"#,
        )
        .bind(tenant_id)
        .bind(visitor_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(room)
    }

    pub async fn find_by_session_token(&self, session_token: &str) -> Result<Option<Room>> {
        let room = sqlx::query_as::<_, Room>(
            r#"SELECT room_id, tenant_id, session_token, visitor_id, status,
                      assigned_agent_id, agent_source, takeover, customer_email,
                      created_at, last_activity_at, closed_at
               FROM rooms WHERE session_token = $1"#,
        )
        .bind(session_token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(room)
    }

    pub async fn get_room(&self, tenant_id: &str, room_id: i64) -> Result<Option<Room>> {
        let room = sqlx::query_as::<_, Room>(
            r#"SELECT room_id, tenant_id, session_token, visitor_id, status,
                      assigned_agent_id, agent_source, takeover, customer_email,
                      created_at, last_activity_at, closed_at
               FROM rooms WHERE tenant_id = $1 AND room_id = $2"#,
        )
        .bind(tenant_id)
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(room)
    }

    pub async fn create_room(
        &self,
        tenant_id: &str,
        session_token: &str,
        visitor_id: &str,
    ) -> Result<Room> {
        let room = sqlx::query_as::<_, Room>(
            r#"INSERT INTO rooms (tenant_id, session_token, visitor_id, status, takeover, created_at, last_activity_at)
               VALUES ($1, $2, $3, 'active', false, now(), now())
               RETURNING room_id, tenant_id, session_token, visitor_id, status,
                         assigned_agent_id, agent_source, takeover, customer_email,
                         created_at, last_activity_at, closed_at"#,
        )
        .bind(tenant_id)
        .bind(session_token)
        .bind(visitor_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(room)
    }

    pub async fn touch_room(&self, tenant_id: &str, room_id: i64) -> Result<()> {
        sqlx::query("UPDATE rooms SET last_activity_at = now() WHERE tenant_id = $1 AND room_id = $2")
            .bind(tenant_id)
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_customer_email(&self, tenant_id: &str, room_id: i64, email: &str) -> Result<()> {
        sqlx::query(
            "UPDATE rooms SET customer_email = $3 WHERE tenant_id = $1 AND room_id = $2 AND customer_email IS NULL",
        )
        .bind(tenant_id)
        .bind(room_id)
        .bind(email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn assign_agent(
        &self,
        tenant_id: &str,
        room_id: i64,
        agent_id: i64,
        agent_source: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE rooms SET assigned_agent_id = $3, agent_source = $4, takeover = true
               WHERE tenant_id = $1 AND room_id = $2"#,
        )
        .bind(tenant_id)
        .bind(room_id)
        .bind(agent_id)
        .bind(agent_source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close_room(&self, tenant_id: &str, room_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE rooms SET status = 'closed', closed_at = now() WHERE tenant_id = $1 AND room_id = $2 AND status = 'active'",
        )
        .bind(tenant_id)
        .bind(room_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Active, unassigned rooms carrying a pending-handover flag, used to
    /// rebuild the in-process queue on process restart.
    pub async fn find_pending_handover_rooms(&self, tenant_id: &str) -> Result<Vec<Room>> {
        let rooms = sqlx::query_as::<_, Room>(
            r#"SELECT r.room_id, r.tenant_id, r.session_token, r.visitor_id, r.status,
                      r.assigned_agent_id, r.agent_source, r.takeover, r.customer_email,
                      r.created_at, r.last_activity_at, r.closed_at
               FROM rooms r
               JOIN session_contexts sc ON sc.room_id = r.room_id
               WHERE r.tenant_id = $1 AND r.status = 'active' AND r.assigned_agent_id IS NULL
                 AND (sc.collected_entities->>'pendingHandover')::boolean IS TRUE"#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rooms)
    }

    pub async fn insert_message(
        &self,
        tenant_id: &str,
        room_id: i64,
        sender_type: &str,
        content: &str,
        metadata: Option<Json>,
        sender_id: Option<i64>,
    ) -> Result<Message> {
        let message = sqlx::query_as::<_, Message>(
            r#"INSERT INTO messages (room_id, tenant_id, sender_type, content, metadata, sender_id, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, now())
               RETURNING message_id, room_id, tenant_id, sender_type, content, metadata, created_at, sender_id"#,
        )
        .bind(room_id)
        .bind(tenant_id)
        .bind(sender_type)
        .bind(content)
        .bind(metadata)
        .bind(sender_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(message)
    }

    /// Last `limit` messages in a room, ascending by `created_at, message_id`.
    pub async fn recent_messages(&self, tenant_id: &str, room_id: i64, limit: i64) -> Result<Vec<Message>> {
        let mut rows = sqlx::query_as::<_, Message>(
            r#"SELECT message_id, room_id, tenant_id, sender_type, content, metadata, created_at, sender_id
               FROM messages WHERE tenant_id = $1 AND room_id = $2
               ORDER BY created_at DESC, message_id DESC
               LIMIT $3"#,
        )
        .bind(tenant_id)
        .bind(room_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows)
    }

    pub async fn history(&self, tenant_id: &str, room_id: i64, limit: i64) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            r#"SELECT message_id, room_id, tenant_id, sender_type, content, metadata, created_at, sender_id
               FROM messages WHERE tenant_id = $1 AND room_id = $2
               ORDER BY created_at ASC, message_id ASC
               LIMIT $3"#,
        )
        .bind(tenant_id)
        .bind(room_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    pub async fn conversations(&self, tenant_id: &str, visitor_id: Option<&str>) -> Result<Vec<(Room, Option<Message>)>> {
        let rooms = sqlx::query_as::<_, Room>(
            r#"SELECT room_id, tenant_id, session_token, visitor_id, status,
                      assigned_agent_id, agent_source, takeover, customer_email,
                      created_at, last_activity_at, closed_at
               FROM rooms
               WHERE tenant_id = $1 AND ($2::text IS NULL OR visitor_id = $2)
               ORDER BY last_activity_at DESC"#,
        )
        .bind(tenant_id)
        .bind(visitor_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rooms.len());
        for room in rooms {
            let last = sqlx::query_as::<_, Message>(
                r#"SELECT message_id, room_id, tenant_id, sender_type, content, metadata, created_at, sender_id
                   FROM messages WHERE tenant_id = $1 AND room_id = $2
                   ORDER BY created_at DESC, message_id DESC LIMIT 1"#,
            )
            .bind(tenant_id)
            .bind(room.room_id)
            .fetch_optional(&self.pool)
            .await?;
            out.push((room, last));
        }
        Ok(out)
    }

    pub async fn get_session_context(&self, tenant_id: &str, room_id: i64) -> Result<SessionContext> {
        use sqlx::Row;

        let row = sqlx::query(
            r#"SELECT collected_entities, current_workflow, workflow_state, updated_at
               FROM session_contexts WHERE tenant_id = $1 AND room_id = $2"#,
        )
        .bind(tenant_id)
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        let ctx = match row {
            Some(r) => {
                let entities: Option<Json> = r.try_get("collected_entities")?;
                let workflow_state: Option<Json> = r.try_get("workflow_state")?;
                SessionContext {
                    room_id,
                    tenant_id: tenant_id.to_string(),
                    collected_entities: entities
                        .and_then(|v| serde_json::from_value::<HashMap<String, Json>>(v).ok())
                        .unwrap_or_default(),
                    current_workflow: r.try_get("current_workflow")?,
                    workflow_state: workflow_state
                        .and_then(|v| serde_json::from_value::<HashMap<String, Json>>(v).ok())
                        .unwrap_or_default(),
                    updated_at: r.try_get("updated_at").unwrap_or_else(|_| Utc::now()),
                }
            }
            None => SessionContext::new(room_id, tenant_id.to_string()),
        };

        Ok(ctx)
    }

    pub async fn save_session_context(&self, ctx: &SessionContext) -> Result<()> {
        let entities = serde_json::to_value(&ctx.collected_entities)?;
        let workflow_state = serde_json::to_value(&ctx.workflow_state)?;

        sqlx::query(
            r#"INSERT INTO session_contexts (room_id, tenant_id, collected_entities, current_workflow, workflow_state, updated_at)
               VALUES ($1, $2, $3, $4, $5, now())
               ON CONFLICT (room_id) DO UPDATE SET
                 collected_entities = EXCLUDED.collected_entities,
                 current_workflow = EXCLUDED.current_workflow,
                 workflow_state = EXCLUDED.workflow_state,
                 updated_at = now()"#,
        )
        .bind(ctx.room_id)
        .bind(&ctx.tenant_id as &TenantId)
        .bind(entities)
        .bind(&ctx.current_workflow)
        .bind(workflow_state)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
