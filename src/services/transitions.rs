//! Preparation status auto-transitions.
//!
//! Two rules run on a timer:
//! - `ready` becomes `active` on the event date;
//! - `active` becomes `to-archive` once the last active event date of the
//!   same asset has passed.
//!
//! Every write is conditional on the current status, so a run can be
//! repeated, or race with another run, without double-applying anything.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::preparation::{PreparationRecord, PreparationStatus};
use crate::repository::PreparationRepository;

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("preparation {0} not found")]
    NotFound(Uuid),

    #[error("asset {0} not found")]
    AssetNotFound(Uuid),

    #[error("cannot move preparation from {from} to {to}")]
    InvalidTransition {
        from: PreparationStatus,
        to: PreparationStatus,
    },

    #[error("archiving requires explicit confirmation")]
    ConfirmationRequired,

    #[error("invalid utc offset: {0} minutes")]
    InvalidOffset(i32),

    #[error(transparent)]
    Repository(#[from] anyhow::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransitionReport {
    pub activated: Vec<Uuid>,
    pub to_archive: Vec<Uuid>,
}

impl TransitionReport {
    pub fn is_empty(&self) -> bool {
        self.activated.is_empty() && self.to_archive.is_empty()
    }
}

#[derive(Clone)]
pub struct TransitionEngine {
    repo: Arc<dyn PreparationRepository>,
    offset: FixedOffset,
}

impl TransitionEngine {
    pub fn new(repo: Arc<dyn PreparationRepository>, utc_offset_minutes: i32) -> Result<Self, TransitionError> {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
            .ok_or(TransitionError::InvalidOffset(utc_offset_minutes))?;
        Ok(Self { repo, offset })
    }

    /// Calendar date of `now` in the reference timezone.
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<TransitionReport, TransitionError> {
        let today = self.today(now);
        let mut report = TransitionReport::default();

        for record in self.repo.list(Some(PreparationStatus::Ready)).await? {
            if record.event_date != today {
                continue;
            }
            let changed = self
                .repo
                .transition(record.id, &[PreparationStatus::Ready], PreparationStatus::Active, now)
                .await?;
            if changed {
                report.activated.push(record.id);
            }
        }

        let active = self.repo.list(Some(PreparationStatus::Active)).await?;
        let mut latest: HashMap<Uuid, NaiveDate> = HashMap::new();
        for record in &active {
            latest
                .entry(record.asset_id)
                .and_modify(|d| *d = (*d).max(record.event_date))
                .or_insert(record.event_date);
        }

        for record in &active {
            let finished = latest
                .get(&record.asset_id)
                .map_or(false, |last| *last < today);
            if !finished {
                continue;
            }
            let changed = self
                .repo
                .transition(record.id, &[PreparationStatus::Active], PreparationStatus::ToArchive, now)
                .await?;
            if changed {
                report.to_archive.push(record.id);
            }
        }

        if !report.is_empty() {
            tracing::info!(
                %today,
                activated = report.activated.len(),
                to_archive = report.to_archive.len(),
                "preparation statuses advanced"
            );
        }
        Ok(report)
    }

    pub async fn list(&self, status: Option<PreparationStatus>) -> Result<Vec<PreparationRecord>, TransitionError> {
        Ok(self.repo.list(status).await?)
    }

    pub async fn mark_out_of_service(&self, id: Uuid, now: DateTime<Utc>) -> Result<PreparationRecord, TransitionError> {
        let from: Vec<PreparationStatus> = PreparationStatus::ALL
            .into_iter()
            .filter(|s| *s != PreparationStatus::Archived)
            .collect();
        self.manual(id, &from, PreparationStatus::OutOfService, now).await
    }

    pub async fn archive(
        &self,
        id: Uuid,
        confirmed: bool,
        now: DateTime<Utc>,
    ) -> Result<PreparationRecord, TransitionError> {
        if !confirmed {
            return Err(TransitionError::ConfirmationRequired);
        }
        let from: Vec<PreparationStatus> = PreparationStatus::ALL
            .into_iter()
            .filter(PreparationStatus::is_archivable)
            .collect();
        self.manual(id, &from, PreparationStatus::Archived, now).await
    }

    pub async fn set_asset_defect(&self, asset_id: Uuid, defect: bool) -> Result<(), TransitionError> {
        if !self.repo.set_asset_defect(asset_id, defect).await? {
            return Err(TransitionError::AssetNotFound(asset_id));
        }
        tracing::info!(%asset_id, defect, "asset defect flag updated");
        Ok(())
    }

    async fn manual(
        &self,
        id: Uuid,
        from: &[PreparationStatus],
        to: PreparationStatus,
        now: DateTime<Utc>,
    ) -> Result<PreparationRecord, TransitionError> {
        let current = self.repo.get(id).await?.ok_or(TransitionError::NotFound(id))?;
        if !from.contains(&current.status) {
            return Err(TransitionError::InvalidTransition {
                from: current.status,
                to,
            });
        }
        if !self.repo.transition(id, from, to, now).await? {
            // Status moved between the read and the write.
            let latest = self.repo.get(id).await?.ok_or(TransitionError::NotFound(id))?;
            return Err(TransitionError::InvalidTransition {
                from: latest.status,
                to,
            });
        }
        tracing::info!(preparation_id = %id, from = %current.status, %to, "preparation moved");
        self.repo.get(id).await?.ok_or(TransitionError::NotFound(id))
    }
}

/// Runs the engine periodically, at most one run at a time.
#[derive(Clone)]
pub struct TransitionScheduler {
    engine: TransitionEngine,
    running: Arc<Mutex<()>>,
}

impl TransitionScheduler {
    pub fn new(engine: TransitionEngine) -> Self {
        Self {
            engine,
            running: Arc::new(Mutex::new(())),
        }
    }

    pub fn engine(&self) -> &TransitionEngine {
        &self.engine
    }

    /// Runs once unless a run is already in progress, in which case `None`.
    pub async fn trigger(&self, now: DateTime<Utc>) -> Option<Result<TransitionReport, TransitionError>> {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::debug!("transition run already in progress, skipping");
            return None;
        };
        Some(self.engine.run(now).await)
    }

    pub fn spawn(self, interval: Duration, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(Err(e)) = self.trigger(Utc::now()).await {
                            tracing::error!(error = %e, "transition run failed");
                        }
                    }
                }
            }
            tracing::info!("transition scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryPreparationRepository;
    use chrono::TimeZone;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    #[test]
    fn test_today_uses_reference_offset() {
        let engine =
            TransitionEngine::new(Arc::new(MemoryPreparationRepository::new()), 120).unwrap();
        // 23:30 UTC on the 2nd is already the 3rd at UTC+2.
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 23, 30, 0).unwrap();
        assert_eq!(engine.today(now), date(3));
    }

    #[test]
    fn test_out_of_range_offset_is_rejected() {
        assert!(TransitionEngine::new(Arc::new(MemoryPreparationRepository::new()), 24 * 60).is_err());
    }

    #[tokio::test]
    async fn test_trigger_skips_while_running() {
        let engine =
            TransitionEngine::new(Arc::new(MemoryPreparationRepository::new()), 0).unwrap();
        let scheduler = TransitionScheduler::new(engine);

        let guard = scheduler.running.lock().await;
        assert!(scheduler.trigger(Utc::now()).await.is_none());
        drop(guard);

        assert!(scheduler.trigger(Utc::now()).await.is_some());
    }

    #[tokio::test]
    async fn test_manual_transitions() {
        let repo = Arc::new(MemoryPreparationRepository::new());
        let engine = TransitionEngine::new(repo.clone(), 0).unwrap();
        let queued = PreparationRecord::new(Uuid::new_v4(), date(3), PreparationStatus::Queued);
        repo.insert(&queued).await.unwrap();
        let now = Utc::now();

        assert!(matches!(
            engine.archive(queued.id, true, now).await,
            Err(TransitionError::InvalidTransition { .. })
        ));
        let oos = engine.mark_out_of_service(queued.id, now).await.unwrap();
        assert_eq!(oos.status, PreparationStatus::OutOfService);
        assert!(matches!(
            engine.archive(Uuid::new_v4(), true, now).await,
            Err(TransitionError::NotFound(_))
        ));
        assert!(matches!(
            engine.archive(queued.id, false, now).await,
            Err(TransitionError::ConfirmationRequired)
        ));
    }
}
