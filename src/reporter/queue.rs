//! Durable outbound queue.
//!
//! Items that could not be delivered wait here and are replayed later, each
//! with its own retry counter and exponential backoff. When a file path is
//! given, the queue is rewritten atomically after every change so it
//! survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemKind {
    Gps,
    PointCompletion,
    Photo,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    /// `None` keeps the item until it is delivered or permanently rejected.
    pub max_attempts: Option<u32>,
    /// Fraction of the delay added or removed at random, `0.0` for none.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Position samples: cheap and soon superseded.
    pub fn telemetry() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            max_attempts: Some(5),
            jitter: 0.1,
        }
    }

    /// Completions and photos: operator evidence, never dropped for
    /// transient failures.
    pub fn evidence() -> Self {
        Self {
            max_attempts: None,
            ..Self::telemetry()
        }
    }

    pub fn for_kind(kind: ItemKind) -> Self {
        match kind {
            ItemKind::Gps => Self::telemetry(),
            ItemKind::PointCompletion | ItemKind::Photo => Self::evidence(),
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay after the `attempts`-th failure: `base * 2^(attempts-1)`, capped.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let delay = self.base.saturating_mul(1u32 << exponent);
        let delay = delay.min(self.max_delay);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(factor.max(0.0))
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(false, |max| attempts >= max)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundItem {
    pub id: Uuid,
    pub kind: ItemKind,
    pub payload: serde_json::Value,
    pub attempts: u32,
    /// Earliest time the next attempt may run, set after a failure.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
}

/// When a replay may first try `item`. A backoff left by an earlier run is
/// honoured; anything else is due now.
fn first_due(item: &OutboundItem, now: Instant) -> Instant {
    item.next_attempt_at
        .and_then(|at| (at - Utc::now()).to_std().ok())
        .map_or(now, |wait| now + wait)
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("no connectivity")]
    Offline,

    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("transport failure: {0}")]
    Transport(String),
}

impl DeliveryError {
    /// Client errors other than timeout and rate limiting will not succeed
    /// on retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Rejected { status, .. }
            if (400..500).contains(status) && *status != 408 && *status != 429)
    }
}

#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn deliver(&self, item: &OutboundItem) -> Result<(), DeliveryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub delivered: usize,
    pub dropped: usize,
    pub remaining: usize,
}

pub struct OutboundQueue {
    items: Mutex<VecDeque<OutboundItem>>,
    path: Option<PathBuf>,
    policies: HashMap<ItemKind, RetryPolicy>,
    replaying: Mutex<()>,
}

impl OutboundQueue {
    pub fn in_memory() -> Self {
        Self::build(VecDeque::new(), None)
    }

    /// Loads whatever a previous run left behind. A missing file is an
    /// empty queue.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        let items = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => VecDeque::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => return Err(e.into()),
        };
        if !items.is_empty() {
            tracing::info!(path = %path.display(), pending = items.len(), "outbound queue restored");
        }
        Ok(Self::build(items, Some(path)))
    }

    fn build(items: VecDeque<OutboundItem>, path: Option<PathBuf>) -> Self {
        let policies = [ItemKind::Gps, ItemKind::PointCompletion, ItemKind::Photo]
            .into_iter()
            .map(|kind| (kind, RetryPolicy::for_kind(kind)))
            .collect();
        Self {
            items: Mutex::new(items),
            path,
            policies,
            replaying: Mutex::new(()),
        }
    }

    pub fn with_policy(mut self, kind: ItemKind, policy: RetryPolicy) -> Self {
        self.policies.insert(kind, policy);
        self
    }

    fn policy(&self, kind: ItemKind) -> RetryPolicy {
        self.policies
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| RetryPolicy::for_kind(kind))
    }

    pub async fn enqueue(&self, kind: ItemKind, payload: serde_json::Value) -> Result<Uuid, QueueError> {
        let item = OutboundItem {
            id: Uuid::new_v4(),
            kind,
            payload,
            attempts: 0,
            next_attempt_at: None,
            enqueued_at: Utc::now(),
        };
        let id = item.id;
        let mut items = self.items.lock().await;
        items.push_back(item);
        self.persist(&items).await?;
        tracing::debug!(item_id = %id, ?kind, pending = items.len(), "outbound item queued");
        Ok(id)
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<OutboundItem> {
        self.items.lock().await.iter().cloned().collect()
    }

    /// Delivers queued items oldest first. Every item keeps its own backoff:
    /// one that fails waits for its next due time while the items behind it
    /// are still attempted.
    ///
    /// Runs until the queue is empty. Stops early, keeping the remaining
    /// items, when the sender reports it is offline or `cancel` fires.
    /// Returns `None` if another replay is already running.
    pub async fn replay(
        &self,
        sender: &dyn OutboundSender,
        cancel: &CancellationToken,
    ) -> Option<Result<ReplayReport, QueueError>> {
        let Ok(_guard) = self.replaying.try_lock() else {
            return None;
        };
        Some(self.drain(sender, cancel).await)
    }

    async fn drain(
        &self,
        sender: &dyn OutboundSender,
        cancel: &CancellationToken,
    ) -> Result<ReplayReport, QueueError> {
        let mut report = ReplayReport::default();
        let mut due: HashMap<Uuid, Instant> = HashMap::new();

        'passes: loop {
            let pending = self.snapshot().await;
            if pending.is_empty() {
                break;
            }
            let mut wake: Option<Instant> = None;

            for mut item in pending {
                if cancel.is_cancelled() {
                    break 'passes;
                }
                let now = Instant::now();
                let at = *due.entry(item.id).or_insert_with(|| first_due(&item, now));
                if at > now {
                    wake = Some(wake.map_or(at, |w| w.min(at)));
                    continue;
                }

                let result = tokio::select! {
                    _ = cancel.cancelled() => break 'passes,
                    result = sender.deliver(&item) => result,
                };
                match result {
                    Ok(()) => {
                        self.remove(item.id).await?;
                        due.remove(&item.id);
                        report.delivered += 1;
                    }
                    Err(DeliveryError::Offline) => break 'passes,
                    Err(e) => {
                        let policy = self.policy(item.kind);
                        item.attempts += 1;
                        if e.is_permanent() || policy.exhausted(item.attempts) {
                            tracing::warn!(
                                item_id = %item.id,
                                kind = ?item.kind,
                                attempts = item.attempts,
                                error = %e,
                                "outbound item dropped"
                            );
                            self.remove(item.id).await?;
                            due.remove(&item.id);
                            report.dropped += 1;
                            continue;
                        }

                        let delay = policy.delay_for(item.attempts);
                        let at = Instant::now() + delay;
                        due.insert(item.id, at);
                        wake = Some(wake.map_or(at, |w| w.min(at)));
                        let next_attempt_at = chrono::Duration::from_std(delay)
                            .ok()
                            .map(|d| Utc::now() + d);
                        self.record_attempt(item.id, item.attempts, next_attempt_at)
                            .await?;
                        tracing::debug!(
                            item_id = %item.id,
                            attempts = item.attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "outbound delivery failed, backing off"
                        );
                    }
                }
            }

            // Items queued during the pass are due at once; no wake needed.
            if let Some(at) = wake {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
        }

        report.remaining = self.len().await;
        Ok(report)
    }

    async fn remove(&self, id: Uuid) -> Result<(), QueueError> {
        let mut items = self.items.lock().await;
        items.retain(|i| i.id != id);
        self.persist(&items).await
    }

    async fn record_attempt(
        &self,
        id: Uuid,
        attempts: u32,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        let mut items = self.items.lock().await;
        if let Some(item) = items.iter_mut().find(|i| i.id == id) {
            item.attempts = attempts;
            item.next_attempt_at = next_attempt_at;
        }
        self.persist(&items).await
    }

    async fn persist(&self, items: &VecDeque<OutboundItem>) -> Result<(), QueueError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(items)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::telemetry().without_jitter();
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 16, 16]);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::telemetry();
        for _ in 0..100 {
            let delay = policy.delay_for(3).as_secs_f64();
            assert!((3.6..=4.4).contains(&delay), "delay {}", delay);
        }
    }

    #[test]
    fn test_policy_per_kind() {
        assert!(RetryPolicy::for_kind(ItemKind::Gps).exhausted(5));
        assert!(!RetryPolicy::for_kind(ItemKind::Gps).exhausted(4));
        assert!(!RetryPolicy::for_kind(ItemKind::Photo).exhausted(1_000));
        assert!(!RetryPolicy::for_kind(ItemKind::PointCompletion).exhausted(1_000));
    }

    #[test]
    fn test_permanent_rejections() {
        let rejected = |status| DeliveryError::Rejected {
            status,
            message: String::new(),
        };
        assert!(rejected(400).is_permanent());
        assert!(!rejected(429).is_permanent());
        assert!(!rejected(503).is_permanent());
        assert!(!DeliveryError::Offline.is_permanent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_backoff_is_honoured() {
        let mut item = OutboundItem {
            id: Uuid::new_v4(),
            kind: ItemKind::Photo,
            payload: serde_json::json!({}),
            attempts: 3,
            next_attempt_at: Some(Utc::now() + chrono::Duration::seconds(30)),
            enqueued_at: Utc::now(),
        };
        let now = Instant::now();

        let due = first_due(&item, now);
        assert!(due > now + Duration::from_secs(29) && due <= now + Duration::from_secs(30));

        item.next_attempt_at = Some(Utc::now() - chrono::Duration::seconds(5));
        assert_eq!(first_due(&item, now), now, "an elapsed backoff is due at once");
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbound.json");

        let queue = OutboundQueue::open(&path).await.unwrap();
        queue
            .enqueue(ItemKind::Photo, serde_json::json!({"point_id": "p1"}))
            .await
            .unwrap();
        drop(queue);

        let reopened = OutboundQueue::open(&path).await.unwrap();
        let items = reopened.snapshot().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, ItemKind::Photo);
        assert_eq!(items[0].attempts, 0);
    }
}
