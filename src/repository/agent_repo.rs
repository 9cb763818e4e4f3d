use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::PgPool;

use crate::models::position::AgentProfile;

/// Field-agent metadata used to label live positions.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Every active field agent, ordered by display name.
    async fn field_agents(&self) -> anyhow::Result<Vec<AgentProfile>>;
}

pub struct PgAgentDirectory {
    pool: PgPool,
}

impl PgAgentDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    display_name: String,
    phone: Option<String>,
}

impl From<AgentRow> for AgentProfile {
    fn from(row: AgentRow) -> Self {
        AgentProfile {
            agent_id: row.id,
            display_name: row.display_name,
            phone: row.phone,
        }
    }
}

#[async_trait]
impl AgentDirectory for PgAgentDirectory {
    async fn field_agents(&self) -> anyhow::Result<Vec<AgentProfile>> {
        let rows = sqlx::query_as::<_, AgentRow>(
            "SELECT id, display_name, phone FROM agents \
             WHERE role = 'field-agent' AND active \
             ORDER BY display_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list field agents: {}", e))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Directory held in memory, for deployments without a database and tests.
#[derive(Default)]
pub struct MemoryAgentDirectory {
    agents: RwLock<Vec<AgentProfile>>,
}

impl MemoryAgentDirectory {
    pub fn new(agents: Vec<AgentProfile>) -> Self {
        Self {
            agents: RwLock::new(agents),
        }
    }

    pub fn upsert(&self, profile: AgentProfile) {
        let mut agents = self.agents.write();
        match agents.iter_mut().find(|a| a.agent_id == profile.agent_id) {
            Some(existing) => *existing = profile,
            None => agents.push(profile),
        }
    }
}

#[async_trait]
impl AgentDirectory for MemoryAgentDirectory {
    async fn field_agents(&self) -> anyhow::Result<Vec<AgentProfile>> {
        let mut agents = self.agents.read().clone();
        agents.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(agents)
    }
}
