//! Ephemeral "latest position per agent" store.
//!
//! Entries expire on their own; nothing ever deletes a position explicitly.

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::Pool;
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::time::Instant;

use crate::models::position::AgentPosition;
use crate::services::cache::expiry_millis;

#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn put(&self, position: &AgentPosition, ttl: Duration) -> anyhow::Result<()>;

    async fn get(&self, agent_id: &str) -> anyhow::Result<Option<AgentPosition>>;

    /// Same order as `agent_ids`; `None` for agents without a live entry.
    async fn get_many(&self, agent_ids: &[String]) -> anyhow::Result<Vec<Option<AgentPosition>>>;
}

fn position_key(agent_id: &str) -> String {
    format!("position:{}", agent_id)
}

/// How often `put` sweeps out expired entries nobody has read.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct MemoryPositionStore {
    entries: DashMap<String, (AgentPosition, Instant)>,
    last_sweep: Mutex<Instant>,
}

impl Default for MemoryPositionStore {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep_expired(&self, now: Instant) {
        {
            let mut last = self.last_sweep.lock();
            if now.duration_since(*last) < SWEEP_INTERVAL {
                return;
            }
            *last = now;
        }
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires)| *expires > now);
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            tracing::debug!(evicted, "expired positions swept");
        }
    }

    fn live(&self, agent_id: &str, now: Instant) -> Option<AgentPosition> {
        let hit = self
            .entries
            .get(agent_id)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0.clone());
        if hit.is_none() {
            self.entries.remove_if(agent_id, |_, (_, expires)| *expires <= now);
        }
        hit
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn put(&self, position: &AgentPosition, ttl: Duration) -> anyhow::Result<()> {
        let now = Instant::now();
        self.sweep_expired(now);
        self.entries
            .insert(position.agent_id.clone(), (position.clone(), now + ttl));
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> anyhow::Result<Option<AgentPosition>> {
        Ok(self.live(agent_id, Instant::now()))
    }

    async fn get_many(&self, agent_ids: &[String]) -> anyhow::Result<Vec<Option<AgentPosition>>> {
        let now = Instant::now();
        Ok(agent_ids.iter().map(|id| self.live(id, now)).collect())
    }
}

pub struct RedisPositionStore {
    pool: Pool,
}

impl RedisPositionStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PositionStore for RedisPositionStore {
    async fn put(&self, position: &AgentPosition, ttl: Duration) -> anyhow::Result<()> {
        let payload = serde_json::to_string(position)?;
        let Some(millis) = expiry_millis(ttl) else {
            return Ok(());
        };
        let mut conn = self.pool.get().await?;
        let _: () = conn
            .pset_ex(position_key(&position.agent_id), payload, millis)
            .await?;
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> anyhow::Result<Option<AgentPosition>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn.get(position_key(agent_id)).await?;
        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }

    async fn get_many(&self, agent_ids: &[String]) -> anyhow::Result<Vec<Option<AgentPosition>>> {
        if agent_ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = agent_ids.iter().map(|id| position_key(id)).collect();
        let mut conn = self.pool.get().await?;
        // MGET always answers with an array, even for a single key.
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        Ok(raw
            .into_iter()
            .zip(agent_ids)
            .map(|(value, agent_id)| {
                value.and_then(|v| match serde_json::from_str(&v) {
                    Ok(position) => Some(position),
                    Err(e) => {
                        tracing::warn!(%agent_id, error = %e, "discarding undecodable position");
                        None
                    }
                })
            })
            .collect())
    }
}
