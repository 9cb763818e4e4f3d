//! Cache-aside layer.
//!
//! Reads go through [`CacheAside::get_or_compute`]. A missing or failing
//! backend never fails the caller: reads degrade to a miss and writes happen
//! in a detached task whose errors are only logged.

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::{Config as RedisConfig, Pool, Runtime};
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// `PSETEX` expiry for `ttl`, rounded down so Redis never keeps an entry
/// past it. `None` below one millisecond, which Redis cannot express.
pub(crate) fn expiry_millis(ttl: Duration) -> Option<u64> {
    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    (millis > 0).then_some(millis)
}

pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    /// Builds the pool lazily; no connection is attempted until first use.
    pub fn new(redis_url: &str) -> anyhow::Result<Self> {
        let cfg = RedisConfig::from_url(redis_url);
        let pool = cfg.create_pool(Some(Runtime::Tokio1))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.pool.get().await?;
        let cached: Option<String> = conn.get(key).await?;
        Ok(cached)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        let Some(millis) = expiry_millis(ttl) else {
            return Ok(());
        };
        let mut conn = self.pool.get().await?;
        let _: () = conn.pset_ex(key, value, millis).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

/// In-process backend for single-instance deployments and tests.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0.clone());
        if hit.is_none() {
            self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        }
        Ok(hit)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct CacheAside {
    backend: Option<Arc<dyn CacheBackend>>,
}

impl CacheAside {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// Every lookup is a miss and nothing is stored.
    pub fn disabled() -> Self {
        Self { backend: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Returns the cached value, or `None` on miss, backend error or an
    /// undecodable payload.
    pub async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let backend = self.backend.as_ref()?;
        match backend.get(key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(key, backend = backend.name(), error = %e, "discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, backend = backend.name(), error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Serializes now, writes later. Never blocks the caller.
    pub fn store_in_background<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let Some(backend) = self.backend.clone() else {
            return;
        };
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache value not serializable, skipping store");
                return;
            }
        };
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = backend.set(&key, json, ttl).await {
                tracing::warn!(key = %key, backend = backend.name(), error = %e, "cache store failed");
            }
        });
    }

    /// Cache-aside read. Only `Ok` results are stored; errors are returned
    /// to the caller untouched and retried on the next call.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.lookup::<T>(key).await {
            tracing::debug!(key, "cache hit");
            return Ok(cached);
        }

        let value = compute().await?;
        self.store_in_background(key, &value, ttl);
        Ok(value)
    }
}
