use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::position::AgentPosition;

/// Durable trail of every accepted position.
#[async_trait]
pub trait PositionHistory: Send + Sync {
    async fn append(&self, position: &AgentPosition) -> anyhow::Result<()>;
}

pub struct PgPositionHistory {
    pool: PgPool,
}

impl PgPositionHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PositionHistory for PgPositionHistory {
    async fn append(&self, position: &AgentPosition) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO position_history \
             (agent_id, latitude, longitude, accuracy, speed, heading, sampled_at, received_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&position.agent_id)
        .bind(position.latitude)
        .bind(position.longitude)
        .bind(position.accuracy)
        .bind(position.speed)
        .bind(position.heading)
        .bind(position.timestamp)
        .bind(position.received_at)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to append position history: {}", e))?;
        Ok(())
    }
}

/// Used when history is not configured.
pub struct NoopPositionHistory;

#[async_trait]
impl PositionHistory for NoopPositionHistory {
    async fn append(&self, _position: &AgentPosition) -> anyhow::Result<()> {
        Ok(())
    }
}
