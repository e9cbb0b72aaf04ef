//! Agent Directory & Queue. Local agents come from
//! `AgentStore`; an optional external source is fetched over HTTP and
//! cached for 5 minutes. The selector scores the union and the queue is
//! an in-process ordered structure rebuilt from Room state on restart.

use anyhow::Result;
use reqwest::Client;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::AgentsConfig;
use crate::database::AgentStore;
use crate::models::domain::{Agent, Priority, QueueEntry};

const EXTERNAL_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Deserialize)]
struct ExternalAgentRow {
    name: String,
    email: String,
    #[serde(default)]
    department: Option<String>,
    #[serde(default)]
    skills: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    max_concurrent: i32,
    #[serde(default)]
    current_load: i32,
}

fn default_max_concurrent() -> i32 {
    5
}

struct ExternalCache {
    agents: Vec<Agent>,
    fetched_at: Instant,
}

/// Source + selector + queue, one per process.
pub struct AgentDirectory {
    store: AgentStore,
    config: AgentsConfig,
    http: Client,
    external_cache: RwLock<Option<ExternalCache>>,
    queue: RwLock<VecDeque<QueueEntry>>,
}

impl AgentDirectory {
    pub fn new(store: AgentStore, config: AgentsConfig) -> Self {
        Self {
            store,
            config,
            http: Client::builder().timeout(Duration::from_secs(10)).build().unwrap_or_else(|_| Client::new()),
            external_cache: RwLock::new(None),
            queue: RwLock::new(VecDeque::new()),
        }
    }

    async fn local_candidates(&self) -> Result<Vec<Agent>> {
        self.store.list_available().await
    }

    /// Fetched via `agents.external.api_url` when enabled, cached 5 minutes.
    /// Degrades to an empty list on any fetch/parse error rather than
    /// failing assignment entirely.
    async fn external_candidates(&self) -> Vec<Agent> {
        if !self.config.external.enabled {
            return Vec::new();
        }

        {
            let cache = self.external_cache.read().await;
            if let Some(c) = cache.as_ref() {
                if c.fetched_at.elapsed() < EXTERNAL_CACHE_TTL {
                    return c.agents.clone();
                }
            }
        }

        let Some(url) = self.config.external.api_url.as_ref() else {
            return Vec::new();
        };

        let mut builder = self.http.get(url);
        if let Some(key) = &self.config.external.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let fetched = match builder.send().await {
            Ok(resp) if resp.status().is_success() => resp.json::<Vec<ExternalAgentRow>>().await.ok(),
            Ok(resp) => {
                warn!("external agent fetch returned {}", resp.status());
                None
            }
            Err(e) => {
                warn!("external agent fetch failed: {e}");
                None
            }
        };

        let agents: Vec<Agent> = fetched
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, row)| Agent {
                agent_id: -(i as i64 + 1),
                source: "external".to_string(),
                name: row.name,
                email: row.email,
                status: "online".to_string(),
                max_concurrent: row.max_concurrent,
                current_load: row.current_load,
                department: row.department,
                skills: row.skills,
            })
            .collect();

        *self.external_cache.write().await = Some(ExternalCache { agents: agents.clone(), fetched_at: Instant::now() });
        agents
    }

    /// `score = (1 - load/max)*100 + skill_matches*20 + (department match ? 30 : 0)
    /// + (PREFER_LOCAL && source==local ? 10 : 0)`.
    fn score(&self, agent: &Agent, department: Option<&str>, required_skills: &[String]) -> f64 {
        let max = agent.max_concurrent.max(1) as f64;
        let load_component = (1.0 - (agent.current_load as f64 / max)) * 100.0;
        let skill_matches = required_skills.iter().filter(|s| agent.skills.iter().any(|a| a == *s)).count();
        let skill_component = skill_matches as f64 * 20.0;
        let department_component = match (department, agent.department.as_deref()) {
            (Some(wanted), Some(have)) if wanted == have => 30.0,
            _ => 0.0,
        };
        let local_component = if self.config.prefer_local && agent.source == "local" { 10.0 } else { 0.0 };
        load_component + skill_component + department_component + local_component
    }

    /// Picks the best-scoring candidate with spare capacity. Ties: lowest
    /// `current_load`, then lowest `agent_id`.
    pub async fn select(&self, department: Option<&str>, required_skills: &[String]) -> Result<Option<Agent>> {
        let mut candidates = self.local_candidates().await?;
        candidates.extend(self.external_candidates().await);
        candidates.retain(|a| a.has_capacity());

        let best = candidates.into_iter().min_by(|a, b| {
            let sa = self.score(a, department, required_skills);
            let sb = self.score(b, department, required_skills);
            sb.partial_cmp(&sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.current_load.cmp(&b.current_load))
                .then(a.agent_id.cmp(&b.agent_id))
        });

        Ok(best)
    }

    /// Looks up a room's already-assigned agent by local id, for responses
    /// that need to echo back who a room is currently assigned to.
    pub async fn find_assigned(&self, agent_id: i64) -> Option<Agent> {
        self.store.find_by_id(agent_id).await.ok().flatten()
    }

    /// Ensures a local row exists for an externally-sourced agent so FK
    /// constraints on `rooms.assigned_agent_id` hold, then increments load.
    pub async fn on_assigned(&self, agent: &Agent) -> Result<Agent> {
        let local = if agent.source == "external" {
            self.store
                .upsert_external_shadow(&agent.name, &agent.email, agent.max_concurrent, agent.department.as_deref())
                .await?
        } else {
            agent.clone()
        };
        self.store.increment_load(local.agent_id).await?;
        Ok(local)
    }

    pub async fn on_released(&self, agent_id: i64) -> Result<()> {
        self.store.decrement_load(agent_id).await
    }

    /// No agent qualified; park the room. Returns 1-based queue position.
    pub async fn enqueue(&self, entry: QueueEntry) -> usize {
        let mut queue = self.queue.write().await;
        queue.push_back(entry);
        Self::reorder(&mut queue);
        queue.len()
    }

    pub async fn dequeue_for_room(&self, room_id: i64) {
        let mut queue = self.queue.write().await;
        queue.retain(|e| e.room_id != room_id);
    }

    pub async fn position(&self, room_id: i64) -> Option<usize> {
        let queue = self.queue.read().await;
        queue.iter().position(|e| e.room_id == room_id).map(|i| i + 1)
    }

    /// Drops entries older than `QUEUE_TIMEOUT`; callers invoke this on a
    /// periodic sweep.
    pub async fn sweep_expired(&self) -> Vec<QueueEntry> {
        let timeout = Duration::from_millis(self.config.queue_timeout_ms);
        let mut queue = self.queue.write().await;
        let now = chrono::Utc::now();
        let (keep, expired): (VecDeque<_>, VecDeque<_>) = queue
            .drain(..)
            .partition(|e| (now - e.enqueued_at).to_std().unwrap_or_default() < timeout);
        *queue = keep;
        debug!("queue sweep dropped {} stale entries", expired.len());
        expired.into_iter().collect()
    }

    /// Priority first (Vip..Low), then FIFO by `enqueued_at` within a tier.
    fn reorder(queue: &mut VecDeque<QueueEntry>) {
        let mut items: Vec<QueueEntry> = queue.drain(..).collect();
        items.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.enqueued_at.cmp(&b.enqueued_at)));
        queue.extend(items);
    }
}

pub fn default_priority() -> Priority {
    Priority::Normal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExternalAgentConfig;

    fn agent(id: i64, source: &str, load: i32, max: i32, dept: Option<&str>, skills: &[&str]) -> Agent {
        Agent {
            agent_id: id,
            source: source.to_string(),
            name: format!("agent{id}"),
            email: format!("a{id}@x.com"),
            status: "online".to_string(),
            max_concurrent: max,
            current_load: load,
            department: dept.map(|s| s.to_string()),
            skills: skills.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn directory() -> AgentDirectory {
        let cfg = AgentsConfig {
            prefer_local: true,
            skill_based_routing: true,
            queue_timeout_ms: 600_000,
            external: ExternalAgentConfig::default(),
        };
        AgentDirectory::new(AgentStore::new(dummy_pool()), cfg)
    }

    fn dummy_pool() -> sqlx::PgPool {
        sqlx::PgPool::connect_lazy("postgres://localhost/nonexistent").unwrap()
    }

    #[test]
    fn scoring_prefers_lower_load() {
        let dir = directory();
        let idle = agent(1, "local", 0, 5, None, &[]);
        let busy = agent(2, "local", 4, 5, None, &[]);
        assert!(dir.score(&idle, None, &[]) > dir.score(&busy, None, &[]));
    }

    #[test]
    fn scoring_rewards_department_and_skill_match() {
        let dir = directory();
        let matched = agent(1, "local", 0, 5, Some("billing"), &["refunds"]);
        let unmatched = agent(2, "local", 0, 5, None, &[]);
        assert!(dir.score(&matched, Some("billing"), &["refunds".to_string()]) > dir.score(&unmatched, Some("billing"), &["refunds".to_string()]));
    }

    #[test]
    fn scoring_prefers_local_when_configured() {
        let dir = directory();
        let local = agent(1, "local", 0, 5, None, &[]);
        let external = agent(1, "external", 0, 5, None, &[]);
        assert!(dir.score(&local, None, &[]) > dir.score(&external, None, &[]));
    }

    #[tokio::test]
    async fn queue_orders_by_priority_then_fifo() {
        let dir = directory();
        let now = chrono::Utc::now();
        dir.enqueue(QueueEntry {
            tenant_id: "acme".to_string(),
            room_id: 1,
            priority: Priority::Normal,
            department: None,
            required_skills: vec![],
            enqueued_at: now,
            customer_info: Default::default(),
        })
        .await;
        dir.enqueue(QueueEntry {
            tenant_id: "acme".to_string(),
            room_id: 2,
            priority: Priority::Vip,
            department: None,
            required_skills: vec![],
            enqueued_at: now + chrono::Duration::seconds(1),
            customer_info: Default::default(),
        })
        .await;

        assert_eq!(dir.position(2).await, Some(1));
        assert_eq!(dir.position(1).await, Some(2));
    }
}
