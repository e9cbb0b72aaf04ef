//! Conversation Core: the room state machine and
//! the `processMessage` turn algorithm that ties the Handover Detector,
//! Extraction Helper, Agent Directory and Query Core together. Per-room
//! serialization uses one `DashMap`-registered lock per room.

use dashmap::DashMap;
use serde_json::{json, Value as Json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use crate::database::SessionStore;
use crate::logging::{ActivityLog, ActivityLogger, ActivityStatus, ActivityType};
use crate::models::domain::{Agent, Message, Room};
use crate::services::agents::AgentDirectory;
use crate::services::extraction::ExtractionHelper;
use crate::services::fanout::{AgentAssignedPayload, BridgeEvent, FanoutHub, ServerEvent, WidgetMessagePayload};
use crate::services::handover::{self, HandoverConfig};
use crate::services::query::{QueryCore, QueryOptions, Source};
use crate::utils::error::ApiError;

const APOLOGY: &str = "I apologize, but I encountered an error processing your request. A member of our team will follow up shortly.";
const PLEASE_WAIT: &str = "All our agents are currently busy. Please wait while we find someone to help you.";

#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Answered { message: Message, sources: Vec<Source> },
    Handover { reason: String, assigned_agent: Option<Agent> },
}

pub struct ConversationCore {
    sessions: SessionStore,
    agents: Arc<AgentDirectory>,
    query: Arc<QueryCore>,
    extraction: Arc<ExtractionHelper>,
    fanout: Arc<FanoutHub>,
    activity: Option<ActivityLogger>,
    handover_config: HandoverConfig,
    room_locks: DashMap<i64, Arc<AsyncMutex<()>>>,
}

impl ConversationCore {
    pub fn new(
        sessions: SessionStore,
        agents: Arc<AgentDirectory>,
        query: Arc<QueryCore>,
        extraction: Arc<ExtractionHelper>,
        fanout: Arc<FanoutHub>,
        activity: Option<ActivityLogger>,
    ) -> Self {
        Self {
            sessions,
            agents,
            query,
            extraction,
            fanout,
            activity,
            handover_config: HandoverConfig::default(),
            room_locks: DashMap::new(),
        }
    }

    fn room_lock(&self, room_id: i64) -> Arc<AsyncMutex<()>> {
        self.room_locks.entry(room_id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    fn log(&self, session_id: i64, activity_type: ActivityType, status: ActivityStatus) {
        if let Some(logger) = &self.activity {
            logger.log(ActivityLog::builder(session_id, 0, activity_type).status(status).build());
        }
    }

    pub async fn start_session(
        &self,
        tenant_id: &str,
        visitor_id: &str,
        session_token: Option<String>,
        room_id: Option<i64>,
    ) -> Result<(Room, Vec<Message>, bool), ApiError> {
        if let Some(id) = room_id {
            if let Some(room) = self.sessions.get_room(tenant_id, id).await.map_err(db_err)? {
                let messages = self.sessions.history(tenant_id, room.room_id, 50).await.map_err(db_err)?;
                return Ok((room, messages, false));
            }
        }

        if let Some(token) = &session_token {
            if let Some(room) = self.sessions.find_by_session_token(token).await.map_err(db_err)? {
                let messages = self.sessions.history(tenant_id, room.room_id, 50).await.map_err(db_err)?;
                return Ok((room, messages, false));
            }
        }

        if let Some(room) = self.sessions.find_active_room(tenant_id, visitor_id).await.map_err(db_err)? {
            let messages = self.sessions.history(tenant_id, room.room_id, 50).await.map_err(db_err)?;
            return Ok((room, messages, false));
        }

        let token = session_token.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let room = self.sessions.create_room(tenant_id, &token, visitor_id).await.map_err(db_err)?;
        self.log(room.room_id, ActivityType::SessionCreated, ActivityStatus::Success);
        Ok((room, Vec::new(), true))
    }

    pub async fn history(&self, tenant_id: &str, room_id: i64, limit: i64) -> Result<Vec<Message>, ApiError> {
        self.sessions.history(tenant_id, room_id, limit.clamp(1, 500)).await.map_err(db_err)
    }

    pub async fn conversations(&self, tenant_id: &str, visitor_id: Option<&str>) -> Result<Vec<(Room, Option<Message>)>, ApiError> {
        self.sessions.conversations(tenant_id, visitor_id).await.map_err(db_err)
    }

    pub async fn close(&self, tenant_id: &str, room_id: i64) -> Result<bool, ApiError> {
        let room = self.sessions.get_room(tenant_id, room_id).await.map_err(db_err)?;
        if let Some(room) = &room {
            if let Some(agent_id) = room.assigned_agent_id {
                let _ = self.agents.on_released(agent_id).await;
            }
            self.agents.dequeue_for_room(room_id).await;
        }
        let closed = self.sessions.close_room(tenant_id, room_id).await.map_err(db_err)?;
        self.fanout.publish(room_id, tenant_id, ServerEvent::SessionUpdate { room_id, status: "closed".to_string(), assigned_agent_id: None });
        Ok(closed)
    }

    /// `/chat/escalate`: force a handover independent of message content.
    /// Mirrors the immediate-handover branch of `process_message` without
    /// requiring a triggering customer message.
    pub async fn escalate(&self, tenant_id: &str, room_id: i64) -> Result<(Option<Agent>, Option<usize>), ApiError> {
        let room = self
            .sessions
            .get_room(tenant_id, room_id)
            .await
            .map_err(db_err)?
            .ok_or_else(|| ApiError::NotFound(format!("room {room_id} not found for tenant {tenant_id}")))?;

        if room.is_assigned() {
            let agent = self.agents.find_assigned(room.assigned_agent_id.unwrap_or_default()).await;
            return Ok((agent, None));
        }

        let ctx = self.sessions.get_session_context(tenant_id, room_id).await.map_err(db_err)?;
        match self.select_and_assign(tenant_id, &room, "manual_escalate").await? {
            Some(agent) => Ok((Some(agent), None)),
            None => {
                self.sessions.insert_message(tenant_id, room_id, "system", PLEASE_WAIT, None, None).await.map_err(db_err)?;
                let position = self.agents.enqueue(crate::models::domain::QueueEntry {
                    tenant_id: tenant_id.to_string(),
                    room_id: room.room_id,
                    priority: crate::models::domain::Priority::Normal,
                    department: None,
                    required_skills: Vec::new(),
                    enqueued_at: chrono::Utc::now(),
                    customer_info: ctx.collected_entities.clone(),
                }).await;
                Ok((None, Some(position)))
            }
        }
    }

    pub async fn agent_message(&self, tenant_id: &str, room_id: i64, agent_id: i64, content: &str) -> Result<Message, ApiError> {
        let message = self
            .sessions
            .insert_message(tenant_id, room_id, "agent", content, None, Some(agent_id))
            .await
            .map_err(db_err)?;
        self.sessions.touch_room(tenant_id, room_id).await.map_err(db_err)?;
        self.fanout.publish(
            room_id,
            tenant_id,
            ServerEvent::NewMessage {
                room_id,
                sender_type: "agent".to_string(),
                content: content.to_string(),
                metadata: None,
                created_at: message.created_at,
            },
        );
        Ok(message)
    }

    /// Step 3/5's "select an agent" path, shared by the immediate-handover
    /// branch and the post-extraction pending-handover branch.
    async fn select_and_assign(&self, tenant_id: &str, room: &Room, reason: &str) -> Result<Option<Agent>, ApiError> {
        let selected = self.agents.select(None, &[]).await.map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        let Some(candidate) = selected else {
            return Ok(None);
        };

        let assigned = self.agents.on_assigned(&candidate).await.map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        self.sessions
            .assign_agent(tenant_id, room.room_id, assigned.agent_id, &assigned.source)
            .await
            .map_err(db_err)?;

        let welcome = format!("You are now connected with {}. How can they help you today?", assigned.name);
        let system_msg = self
            .sessions
            .insert_message(tenant_id, room.room_id, "system", &welcome, None, None)
            .await
            .map_err(db_err)?;
        self.fanout.publish(
            room.room_id,
            tenant_id,
            ServerEvent::NewMessage {
                room_id: room.room_id,
                sender_type: "system".to_string(),
                content: welcome,
                metadata: None,
                created_at: system_msg.created_at,
            },
        );
        self.fanout.publish(
            room.room_id,
            tenant_id,
            ServerEvent::SessionUpdate { room_id: room.room_id, status: "active".to_string(), assigned_agent_id: Some(assigned.agent_id) },
        );
        self.fanout.publish_bridge(BridgeEvent::AgentAssigned(AgentAssignedPayload {
            agent_email: assigned.email.clone(),
            agent_name: assigned.name.clone(),
            room_id: room.room_id,
            client_id: room.visitor_id.clone(),
            customer_email: room.customer_email.clone(),
        }));
        self.log(room.room_id, ActivityType::AgentAssigned, ActivityStatus::Success);
        let _ = reason;
        Ok(Some(assigned))
    }

    async fn enqueue_room(&self, tenant_id: &str, room: &Room, customer_info: HashMap<String, Json>) {
        self.agents
            .enqueue(crate::models::domain::QueueEntry {
                tenant_id: tenant_id.to_string(),
                room_id: room.room_id,
                priority: crate::models::domain::Priority::Normal,
                department: None,
                required_skills: Vec::new(),
                enqueued_at: chrono::Utc::now(),
                customer_info,
            })
            .await;
    }

    async fn emit_customer_message(&self, tenant_id: &str, room: &Room, message: &Message) {
        self.fanout.publish(
            room.room_id,
            tenant_id,
            ServerEvent::NewMessage {
                room_id: room.room_id,
                sender_type: "customer".to_string(),
                content: message.content.clone(),
                metadata: message.metadata.clone(),
                created_at: message.created_at,
            },
        );
        self.fanout.publish_bridge(BridgeEvent::WidgetMessage(WidgetMessagePayload {
            id: message.message_id,
            conversation_id: room.room_id,
            client_id: room.visitor_id.clone(),
            content: message.content.clone(),
            sender_type: "customer".to_string(),
            created_at: message.created_at,
            metadata: message.metadata.clone(),
            name: None,
            email: room.customer_email.clone(),
            topic: None,
            status: room.status.clone(),
            takeover: room.takeover,
        }));
    }

    fn emit_typing(&self, room_id: i64, tenant_id: &str, is_typing: bool) {
        self.fanout.publish(room_id, tenant_id, ServerEvent::Typing { room_id, who: "ai".to_string(), is_typing });
    }

    /// `processMessage(tenant, room, content)`, the 10-step turn algorithm.
    pub async fn process_message(&self, tenant_id: &str, room_id: i64, content: &str) -> Result<TurnOutcome, ApiError> {
        let lock = self.room_lock(room_id);
        let _guard = lock.lock().await;

        // Step 1: persist, emit, mirror, touch.
        let room = self
            .sessions
            .get_room(tenant_id, room_id)
            .await
            .map_err(db_err)?
            .ok_or_else(|| ApiError::NotFound(format!("room {room_id} not found for tenant {tenant_id}")))?;

        let customer_message = self
            .sessions
            .insert_message(tenant_id, room_id, "customer", content, None, None)
            .await
            .map_err(db_err)?;
        self.log(room_id, ActivityType::RequestReceived, ActivityStatus::Info);
        self.emit_customer_message(tenant_id, &room, &customer_message).await;
        self.sessions.touch_room(tenant_id, room_id).await.map_err(db_err)?;

        // Step 2: load context concurrently.
        let (history, mut ctx) = tokio::try_join!(
            async { self.sessions.history(tenant_id, room_id, 10).await.map_err(db_err) },
            async { Ok::<_, ApiError>(self.sessions.get_session_context(tenant_id, room_id).await.map_err(db_err)?) },
        )?;

        // Step 3: handover detection.
        if let Some(verdict) = handover::detect(content, &history, &ctx.collected_entities, &self.handover_config) {
            self.log(room_id, ActivityType::HandoverTriggered, ActivityStatus::Info);

            if verdict.immediate {
                if room.is_assigned() {
                    let reminder = self
                        .sessions
                        .insert_message(tenant_id, room_id, "system", "A human agent is already assisting you.", None, None)
                        .await
                        .map_err(db_err)?;
                    self.fanout.publish(
                        room_id,
                        tenant_id,
                        ServerEvent::NewMessage {
                            room_id,
                            sender_type: "system".to_string(),
                            content: reminder.content,
                            metadata: None,
                            created_at: reminder.created_at,
                        },
                    );
                    return Ok(TurnOutcome::Handover { reason: verdict.reason.to_string(), assigned_agent: None });
                }

                return match self.select_and_assign(tenant_id, &room, verdict.reason).await? {
                    Some(agent) => Ok(TurnOutcome::Handover { reason: verdict.reason.to_string(), assigned_agent: Some(agent) }),
                    None => {
                        self.sessions.insert_message(tenant_id, room_id, "system", PLEASE_WAIT, None, None).await.map_err(db_err)?;
                        self.enqueue_room(tenant_id, &room, ctx.collected_entities.clone()).await;
                        Ok(TurnOutcome::Handover { reason: verdict.reason.to_string(), assigned_agent: None })
                    }
                };
            }

            // Assisted: remember the reason and fall through so the LLM
            // keeps collecting identity this turn.
            ctx.set_pending_handover(verdict.reason);
            self.sessions.save_session_context(&ctx).await.map_err(db_err)?;
        }

        // Step 4.
        self.emit_typing(room_id, tenant_id, true);

        // Step 5: entity extraction.
        let extracted = self.extraction.extract(content).await;
        let newly_has_identity = ["email", "name", "phone"].iter().any(|k| extracted.contains_key(*k));
        ctx.merge_entities(extracted.clone());

        if let Some(email) = extracted.get("email").and_then(|v| v.as_str()) {
            let _ = self.sessions.set_customer_email(tenant_id, room_id, email).await;
        }

        if ctx.pending_handover().is_some() && newly_has_identity {
            let reason = ctx.pending_handover().unwrap_or_else(|| "assisted_issue".to_string());
            ctx.clear_pending_handover();
            self.sessions.save_session_context(&ctx).await.map_err(db_err)?;

            if let Some(agent) = self.select_and_assign(tenant_id, &room, &reason).await? {
                self.emit_typing(room_id, tenant_id, false);
                return Ok(TurnOutcome::Handover { reason, assigned_agent: Some(agent) });
            }
        } else {
            self.sessions.save_session_context(&ctx).await.map_err(db_err)?;
        }

        // Step 6-7: query, with the apology-on-error policy.
        let opts = QueryOptions { history: history.clone(), collected_entities: ctx.collected_entities.clone(), document_ids: None };
        let query_result = self.query.query(tenant_id, content, opts).await;

        let (text, sources, confidence, intent) = match query_result {
            Ok(r) => {
                self.log(room_id, ActivityType::RetrievalExecuted, ActivityStatus::Success);
                (r.text, r.sources, r.confidence, "vector")
            }
            Err(e) => {
                self.log(room_id, ActivityType::LlmError, ActivityStatus::Error);
                let apology = self
                    .sessions
                    .insert_message(tenant_id, room_id, "ai", APOLOGY, Some(json!({"error": e.to_string()})), None)
                    .await
                    .map_err(db_err)?;
                self.fanout.publish(
                    room_id,
                    tenant_id,
                    ServerEvent::NewMessage {
                        room_id,
                        sender_type: "ai".to_string(),
                        content: apology.content.clone(),
                        metadata: apology.metadata.clone(),
                        created_at: apology.created_at,
                    },
                );
                self.emit_typing(room_id, tenant_id, false);
                return Err(e);
            }
        };

        // Step 8: persist + emit AI answer.
        let metadata = json!({
            "sources": sources.iter().map(|s| json!({
                "document_id": s.document_id,
                "chunk_id": s.chunk_id,
                "similarity": s.similarity,
            })).collect::<Vec<_>>(),
            "intent": intent,
            "confidence": confidence,
        });
        let ai_message = self
            .sessions
            .insert_message(tenant_id, room_id, "ai", &text, Some(metadata.clone()), None)
            .await
            .map_err(db_err)?;
        self.log(room_id, ActivityType::MessageSent, ActivityStatus::Success);
        self.fanout.publish(
            room_id,
            tenant_id,
            ServerEvent::NewMessage {
                room_id,
                sender_type: "ai".to_string(),
                content: ai_message.content.clone(),
                metadata: Some(metadata),
                created_at: ai_message.created_at,
            },
        );
        self.fanout.publish_bridge(BridgeEvent::WidgetMessage(WidgetMessagePayload {
            id: ai_message.message_id,
            conversation_id: room_id,
            client_id: room.visitor_id.clone(),
            content: ai_message.content.clone(),
            sender_type: "ai".to_string(),
            created_at: ai_message.created_at,
            metadata: ai_message.metadata.clone(),
            name: None,
            email: room.customer_email.clone(),
            topic: None,
            status: room.status.clone(),
            takeover: room.takeover,
        }));

        // Step 9: no-op — the Query Core does not surface additional
        // entities beyond the Extraction Helper in this implementation.

        // Step 10.
        self.emit_typing(room_id, tenant_id, false);

        Ok(TurnOutcome::Answered { message: ai_message, sources })
    }

    /// Periodic sweep: drops stale queue entries and releases them back
    /// into a "please wait" state; callers schedule this on a ticker.
    pub async fn sweep_expired_queue_entries(&self) -> usize {
        self.agents.sweep_expired().await.len()
    }
}

fn db_err(e: anyhow::Error) -> ApiError {
    ApiError::DatabaseError(e.to_string())
}
