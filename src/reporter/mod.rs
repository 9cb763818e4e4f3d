//! Field-side position reporter.
//!
//! Three activities run from one fix stream until [`ReporterHandle::stop`]:
//! the fix watcher, the adaptive primary sender and the fixed-period backup
//! sender. A fourth task replays the outbound queue whenever connectivity
//! comes back.

pub mod http;
pub mod policy;
pub mod queue;
pub mod socket;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::models::position::PositionReport;
pub use policy::{SamplingDecision, SamplingMode, SamplingPolicy};
pub use queue::{DeliveryError, ItemKind, OutboundItem, OutboundQueue, OutboundSender, RetryPolicy};
pub use socket::SocketSink;

/// Options passed to the platform location service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    /// Cached fixes older than this are not acceptable.
    pub maximum_age: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_secs(15),
            maximum_age: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("position unavailable: {0}")]
    Unavailable(String),

    #[error("no fix within timeout")]
    Timeout,

    #[error("location permission denied")]
    PermissionDenied,
}

/// Push-based stream of fixes from the device.
pub trait PositionSource: Send + Sync {
    fn watch(&self, options: WatchOptions) -> BoxStream<'static, Result<PositionReport, SourceError>>;
}

pub trait PowerMonitor: Send + Sync {
    /// Remaining battery as a fraction, `None` when unknown.
    fn reserve(&self) -> Option<f64>;
}

/// Device without a battery reading.
pub struct UnknownPower;

impl PowerMonitor for UnknownPower {
    fn reserve(&self) -> Option<f64> {
        None
    }
}

/// One delivery channel for live positions.
#[async_trait]
pub trait PositionSink: Send + Sync {
    async fn send(&self, report: &PositionReport) -> Result<(), DeliveryError>;
}

#[derive(Clone, Debug)]
pub struct ReporterConfig {
    pub policy: SamplingPolicy,
    pub backup_interval: Duration,
    pub watch: WatchOptions,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            policy: SamplingPolicy::default(),
            backup_interval: Duration::from_secs(60),
            watch: WatchOptions::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ReporterStats {
    pub fixes: AtomicU64,
    pub stale_fixes: AtomicU64,
    pub primary_sent: AtomicU64,
    pub queued: AtomicU64,
    pub backup_sent: AtomicU64,
    pub backup_failed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub fixes: u64,
    pub stale_fixes: u64,
    pub primary_sent: u64,
    pub queued: u64,
    pub backup_sent: u64,
    pub backup_failed: u64,
}

impl ReporterStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fixes: self.fixes.load(Ordering::Relaxed),
            stale_fixes: self.stale_fixes.load(Ordering::Relaxed),
            primary_sent: self.primary_sent.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            backup_sent: self.backup_sent.load(Ordering::Relaxed),
            backup_failed: self.backup_failed.load(Ordering::Relaxed),
        }
    }
}

pub struct FieldReporter {
    pub source: Arc<dyn PositionSource>,
    pub power: Arc<dyn PowerMonitor>,
    pub primary: Arc<dyn PositionSink>,
    pub backup: Arc<dyn PositionSink>,
    pub queue: Arc<OutboundQueue>,
    pub replay_sender: Arc<dyn OutboundSender>,
    /// `true` while the device believes it is online.
    pub connectivity: watch::Receiver<bool>,
    pub config: ReporterConfig,
}

/// Shared between the reporter tasks.
struct Shared {
    latest: Mutex<Option<PositionReport>>,
    stats: ReporterStats,
    replay_wanted: Notify,
}

pub struct ReporterHandle {
    cancel: CancellationToken,
    tracker: TaskTracker,
    shared: Arc<Shared>,
    decision: watch::Receiver<SamplingDecision>,
}

impl ReporterHandle {
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn decision(&self) -> SamplingDecision {
        *self.decision.borrow()
    }

    pub fn latest_fix(&self) -> Option<PositionReport> {
        self.shared.latest.lock().clone()
    }

    /// Cancels every activity and waits for them to finish. Nothing is sent
    /// or queued once this returns.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("field reporter stopped");
    }
}

impl FieldReporter {
    pub fn start(self) -> ReporterHandle {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let shared = Arc::new(Shared {
            latest: Mutex::new(None),
            stats: ReporterStats::default(),
            replay_wanted: Notify::new(),
        });
        let (decision_tx, decision_rx) = watch::channel(self.config.policy.normal());

        tracker.spawn(watch_fixes(
            self.source.clone(),
            self.power.clone(),
            self.config.clone(),
            shared.clone(),
            decision_tx,
            cancel.clone(),
        ));
        tracker.spawn(primary_loop(
            self.primary.clone(),
            self.queue.clone(),
            self.connectivity.clone(),
            decision_rx.clone(),
            shared.clone(),
            cancel.clone(),
        ));
        tracker.spawn(backup_loop(
            self.backup.clone(),
            self.config.backup_interval,
            shared.clone(),
            cancel.clone(),
        ));
        tracker.spawn(replay_loop(
            self.queue,
            self.replay_sender,
            self.connectivity,
            shared.clone(),
            cancel.clone(),
        ));

        tracing::info!("field reporter started");
        ReporterHandle {
            cancel,
            tracker,
            shared,
            decision: decision_rx,
        }
    }
}

fn is_stale(report: &PositionReport, maximum_age: Duration) -> bool {
    let age = chrono::Utc::now() - report.timestamp;
    chrono::Duration::from_std(maximum_age).map_or(false, |max| age > max)
}

async fn watch_fixes(
    source: Arc<dyn PositionSource>,
    power: Arc<dyn PowerMonitor>,
    config: ReporterConfig,
    shared: Arc<Shared>,
    decision_tx: watch::Sender<SamplingDecision>,
    cancel: CancellationToken,
) {
    loop {
        let options = WatchOptions {
            high_accuracy: decision_tx.borrow().high_accuracy,
            ..config.watch
        };
        let mut fixes = source.watch(options);

        // Re-subscribe when the accuracy requirement changes.
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = fixes.next() => next,
            };
            match next {
                Some(Ok(report)) => {
                    if is_stale(&report, config.watch.maximum_age) {
                        shared.stats.stale_fixes.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    shared.stats.fixes.fetch_add(1, Ordering::Relaxed);
                    let decision = config.policy.decide(report.speed, power.reserve());
                    *shared.latest.lock() = Some(report);

                    let previous = *decision_tx.borrow();
                    if decision != previous {
                        tracing::info!(mode = ?decision.mode, interval_secs = decision.interval.as_secs(), "sampling mode changed");
                        decision_tx.send_replace(decision);
                    }
                    if decision.high_accuracy != options.high_accuracy {
                        break;
                    }
                }
                Some(Err(e)) => tracing::warn!(error = %e, "position fix failed"),
                None => {
                    tracing::warn!("position stream ended, re-subscribing");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => break,
                    }
                }
            }
        }
    }
}

async fn primary_loop(
    primary: Arc<dyn PositionSink>,
    queue: Arc<OutboundQueue>,
    connectivity: watch::Receiver<bool>,
    mut decision: watch::Receiver<SamplingDecision>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut last_sent = None;
    loop {
        let interval = decision.borrow_and_update().interval;
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = decision.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(report) = shared.latest.lock().clone() else {
            continue;
        };
        if last_sent == Some(report.timestamp) {
            continue;
        }
        last_sent = Some(report.timestamp);

        let online = *connectivity.borrow();
        let result = if online {
            // Same as the backup: a call in flight at stop is abandoned.
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = primary.send(&report) => result,
            }
        } else {
            Err(DeliveryError::Offline)
        };
        match result {
            Ok(()) => {
                shared.stats.primary_sent.fetch_add(1, Ordering::Relaxed);
                if !queue.is_empty().await {
                    shared.replay_wanted.notify_one();
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "primary send failed, queueing");
                match serde_json::to_value(&report) {
                    Ok(payload) => match queue.enqueue(ItemKind::Gps, payload).await {
                        Ok(_) => {
                            shared.stats.queued.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => tracing::error!(error = %e, "position could not be queued"),
                    },
                    Err(e) => tracing::error!(error = %e, "position not serializable"),
                }
            }
        }
    }
}

async fn backup_loop(
    backup: Arc<dyn PositionSink>,
    period: Duration,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(report) = shared.latest.lock().clone() else {
            continue;
        };
        // A call still in flight at stop is abandoned and its result ignored.
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = backup.send(&report) => result,
        };
        match result {
            Ok(()) => {
                shared.stats.backup_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                shared.stats.backup_failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %e, "backup send failed");
            }
        }
    }
}

async fn replay_loop(
    queue: Arc<OutboundQueue>,
    sender: Arc<dyn OutboundSender>,
    mut connectivity: watch::Receiver<bool>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut due = *connectivity.borrow_and_update();
    loop {
        if due && !queue.is_empty().await {
            if let Some(outcome) = queue.replay(sender.as_ref(), &cancel).await {
                match outcome {
                    Ok(report) => tracing::info!(
                        delivered = report.delivered,
                        dropped = report.dropped,
                        remaining = report.remaining,
                        "outbound queue replayed"
                    ),
                    Err(e) => tracing::error!(error = %e, "outbound queue replay failed"),
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = connectivity.changed() => {
                if changed.is_err() {
                    return;
                }
                due = *connectivity.borrow_and_update();
            }
            _ = shared.replay_wanted.notified() => {
                due = *connectivity.borrow();
            }
        }
    }
}
