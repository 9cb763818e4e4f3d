//! Status auto-transition rules against the in-memory repository.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use waypoint::models::preparation::{PreparationRecord, PreparationStatus};
use waypoint::repository::{MemoryPreparationRepository, PreparationRepository};
use waypoint::services::transitions::{TransitionEngine, TransitionError, TransitionScheduler};

fn date(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
}

/// Noon UTC on the given day of June 2024.
fn noon(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, d, 12, 0, 0).unwrap()
}

async fn seed(repo: &MemoryPreparationRepository, asset: Uuid, d: u32, status: PreparationStatus) -> Uuid {
    let record = PreparationRecord::new(asset, date(d), status);
    repo.insert(&record).await.unwrap();
    record.id
}

async fn status_of(repo: &MemoryPreparationRepository, id: Uuid) -> PreparationStatus {
    repo.get(id).await.unwrap().unwrap().status
}

#[tokio::test]
async fn test_ready_becomes_active_on_event_date_only() {
    let repo = Arc::new(MemoryPreparationRepository::new());
    let asset = Uuid::new_v4();
    let today = seed(&repo, asset, 3, PreparationStatus::Ready).await;
    let tomorrow = seed(&repo, Uuid::new_v4(), 4, PreparationStatus::Ready).await;
    let queued = seed(&repo, Uuid::new_v4(), 3, PreparationStatus::Queued).await;
    let engine = TransitionEngine::new(repo.clone(), 0).unwrap();

    let report = engine.run(noon(3)).await.unwrap();

    assert_eq!(report.activated, vec![today]);
    assert_eq!(status_of(&repo, today).await, PreparationStatus::Active);
    assert_eq!(status_of(&repo, tomorrow).await, PreparationStatus::Ready);
    assert_eq!(status_of(&repo, queued).await, PreparationStatus::Queued);
}

#[tokio::test]
async fn test_event_date_compared_in_reference_timezone() {
    let repo = Arc::new(MemoryPreparationRepository::new());
    let id = seed(&repo, Uuid::new_v4(), 4, PreparationStatus::Ready).await;
    let engine = TransitionEngine::new(repo.clone(), 120).unwrap();

    // 22:30 UTC on the 3rd is 00:30 on the 4th at UTC+2.
    let late = Utc.with_ymd_and_hms(2024, 6, 3, 22, 30, 0).unwrap();
    engine.run(late).await.unwrap();

    assert_eq!(status_of(&repo, id).await, PreparationStatus::Active);
}

#[tokio::test]
async fn test_active_waits_for_latest_date_of_same_asset() {
    let repo = Arc::new(MemoryPreparationRepository::new());
    let asset = Uuid::new_v4();
    let past = seed(&repo, asset, 1, PreparationStatus::Active).await;
    let current = seed(&repo, asset, 3, PreparationStatus::Active).await;
    let engine = TransitionEngine::new(repo.clone(), 0).unwrap();

    // The asset still has an active record dated today.
    let report = engine.run(noon(3)).await.unwrap();
    assert!(report.to_archive.is_empty());
    assert_eq!(status_of(&repo, past).await, PreparationStatus::Active);

    // Once every active date has passed, all of them move together.
    let report = engine.run(noon(4)).await.unwrap();
    assert_eq!(report.to_archive.len(), 2);
    assert_eq!(status_of(&repo, past).await, PreparationStatus::ToArchive);
    assert_eq!(status_of(&repo, current).await, PreparationStatus::ToArchive);
}

#[tokio::test]
async fn test_other_assets_do_not_hold_back_archiving() {
    let repo = Arc::new(MemoryPreparationRepository::new());
    let finished = seed(&repo, Uuid::new_v4(), 1, PreparationStatus::Active).await;
    let running = seed(&repo, Uuid::new_v4(), 5, PreparationStatus::Active).await;
    let engine = TransitionEngine::new(repo.clone(), 0).unwrap();

    engine.run(noon(3)).await.unwrap();

    assert_eq!(status_of(&repo, finished).await, PreparationStatus::ToArchive);
    assert_eq!(status_of(&repo, running).await, PreparationStatus::Active);
}

#[tokio::test]
async fn test_running_twice_is_a_no_op() {
    let repo = Arc::new(MemoryPreparationRepository::new());
    let asset = Uuid::new_v4();
    seed(&repo, asset, 3, PreparationStatus::Ready).await;
    seed(&repo, Uuid::new_v4(), 1, PreparationStatus::Active).await;
    let engine = TransitionEngine::new(repo.clone(), 0).unwrap();

    let first = engine.run(noon(3)).await.unwrap();
    let after_first = repo.list(None).await.unwrap();
    let second = engine.run(noon(3)).await.unwrap();
    let after_second = repo.list(None).await.unwrap();

    assert_eq!(first.activated.len(), 1);
    assert_eq!(first.to_archive.len(), 1);
    assert!(second.is_empty(), "second run must change nothing");
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn test_concurrent_runs_apply_each_transition_once() {
    let repo = Arc::new(MemoryPreparationRepository::new());
    for d in [3, 3, 3] {
        seed(&repo, Uuid::new_v4(), d, PreparationStatus::Ready).await;
    }
    let a = TransitionEngine::new(repo.clone(), 0).unwrap();
    let b = a.clone();

    let (ra, rb) = tokio::join!(a.run(noon(3)), b.run(noon(3)));

    let total = ra.unwrap().activated.len() + rb.unwrap().activated.len();
    assert_eq!(total, 3);
}

#[tokio::test]
async fn test_archive_and_defect_flag() {
    let repo = Arc::new(MemoryPreparationRepository::new());
    let asset = Uuid::new_v4();
    let id = seed(&repo, asset, 3, PreparationStatus::ToArchive).await;
    let engine = TransitionEngine::new(repo.clone(), 0).unwrap();

    engine.set_asset_defect(asset, true).await.unwrap();
    assert_eq!(repo.asset_defect(asset).await.unwrap(), Some(true));

    let archived = engine.archive(id, true, noon(5)).await.unwrap();
    assert_eq!(archived.status, PreparationStatus::Archived);
    assert_eq!(archived.archived_at, Some(noon(5)));
    // The defect flag is independent of lifecycle.
    assert_eq!(repo.asset_defect(asset).await.unwrap(), Some(true));

    assert!(matches!(
        engine.mark_out_of_service(id, noon(5)).await,
        Err(TransitionError::InvalidTransition { .. })
    ));
    assert!(matches!(
        engine.set_asset_defect(Uuid::new_v4(), true).await,
        Err(TransitionError::AssetNotFound(_))
    ));
}

#[tokio::test]
async fn test_scheduler_stops_on_shutdown() {
    let repo = Arc::new(MemoryPreparationRepository::new());
    let scheduler = TransitionScheduler::new(TransitionEngine::new(repo, 0).unwrap());
    let shutdown = CancellationToken::new();

    let handle = scheduler.spawn(Duration::from_millis(10), shutdown.clone());
    tokio::time::sleep(Duration::from_millis(30)).await;
    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("scheduler must stop")
        .unwrap();
}
