//! Position ingestion and the "all current positions" view.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::broadcast::{BroadcastPort, Channel};
use super::position_store::PositionStore;
use crate::models::events::ServerEvent;
use crate::models::position::{AgentPosition, AgentSnapshot, PositionReport};
use crate::repository::{AgentDirectory, PositionHistory};

#[derive(Debug, thiserror::Error)]
pub enum PositionError {
    #[error("invalid position: {0}")]
    Invalid(String),

    #[error("position store unavailable: {0}")]
    Store(#[source] anyhow::Error),

    #[error("agent directory unavailable: {0}")]
    Directory(#[source] anyhow::Error),
}

#[derive(Clone)]
pub struct PositionService {
    store: Arc<dyn PositionStore>,
    directory: Arc<dyn AgentDirectory>,
    history: Arc<dyn PositionHistory>,
    broadcast: Arc<dyn BroadcastPort>,
    freshness: Duration,
}

impl PositionService {
    pub fn new(
        store: Arc<dyn PositionStore>,
        directory: Arc<dyn AgentDirectory>,
        history: Arc<dyn PositionHistory>,
        broadcast: Arc<dyn BroadcastPort>,
        freshness: Duration,
    ) -> Self {
        Self {
            store,
            directory,
            history,
            broadcast,
            freshness,
        }
    }

    /// Stores the latest position, appends it to history and tells observers.
    ///
    /// Observers never see a position that a subsequent `all-positions` read
    /// could miss: the store write finishes before the broadcast goes out.
    /// History is appended off the request path and failures are only logged.
    pub async fn record(
        &self,
        agent_id: &str,
        report: &PositionReport,
    ) -> Result<AgentPosition, PositionError> {
        report.validate().map_err(PositionError::Invalid)?;
        let position = AgentPosition::from_report(agent_id, report, Utc::now());

        self.store
            .put(&position, self.freshness)
            .await
            .map_err(PositionError::Store)?;

        let history = self.history.clone();
        let entry = position.clone();
        tokio::spawn(async move {
            if let Err(e) = history.append(&entry).await {
                tracing::warn!(agent_id = %entry.agent_id, error = %e, "position history append failed");
            }
        });

        let delivered = self.broadcast.publish(
            &Channel::Observers,
            ServerEvent::PositionBroadcast {
                agent_id: agent_id.to_string(),
                position: position.clone(),
            },
        );
        tracing::debug!(%agent_id, delivered, "position broadcast");

        Ok(position)
    }

    /// One row per field agent of the directory, whether or not they have
    /// reported recently.
    pub async fn snapshot(&self, now: DateTime<Utc>) -> Result<Vec<AgentSnapshot>, PositionError> {
        let agents = self
            .directory
            .field_agents()
            .await
            .map_err(PositionError::Directory)?;
        let ids: Vec<String> = agents.iter().map(|a| a.agent_id.clone()).collect();
        let positions = self
            .store
            .get_many(&ids)
            .await
            .map_err(PositionError::Store)?;

        Ok(agents
            .into_iter()
            .zip(positions)
            .map(|(agent, position)| AgentSnapshot {
                is_online: position.as_ref().map_or(false, |p| p.is_online_at(now)),
                agent_id: agent.agent_id,
                display_name: agent.display_name,
                phone: agent.phone,
                position,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::position::AgentProfile;
    use crate::repository::MemoryAgentDirectory;
    use crate::services::position_store::MemoryPositionStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    mockall::mock! {
        History {}

        #[async_trait]
        impl PositionHistory for History {
            async fn append(&self, position: &AgentPosition) -> anyhow::Result<()>;
        }
    }

    /// Records the order in which the store and the broadcast are touched.
    #[derive(Default)]
    struct Spy {
        log: Mutex<Vec<&'static str>>,
        inner: MemoryPositionStore,
    }

    #[async_trait]
    impl PositionStore for Spy {
        async fn put(&self, position: &AgentPosition, ttl: Duration) -> anyhow::Result<()> {
            tokio::task::yield_now().await;
            self.inner.put(position, ttl).await?;
            self.log.lock().push("store");
            Ok(())
        }

        async fn get(&self, agent_id: &str) -> anyhow::Result<Option<AgentPosition>> {
            self.inner.get(agent_id).await
        }

        async fn get_many(&self, ids: &[String]) -> anyhow::Result<Vec<Option<AgentPosition>>> {
            self.inner.get_many(ids).await
        }
    }

    impl BroadcastPort for Spy {
        fn publish(&self, _channel: &Channel, _event: ServerEvent) -> usize {
            self.log.lock().push("publish");
            1
        }
    }

    fn report() -> PositionReport {
        PositionReport {
            latitude: 48.85,
            longitude: 2.35,
            accuracy: Some(4.0),
            speed: Some(1.2),
            heading: None,
            timestamp: Utc::now(),
        }
    }

    fn service(spy: Arc<Spy>, history: MockHistory, agents: Vec<AgentProfile>) -> PositionService {
        PositionService::new(
            spy.clone(),
            Arc::new(MemoryAgentDirectory::new(agents)),
            Arc::new(history),
            spy,
            Duration::from_secs(300),
        )
    }

    fn quiet_history() -> MockHistory {
        let mut history = MockHistory::new();
        history.expect_append().returning(|_| Ok(()));
        history
    }

    #[tokio::test]
    async fn test_store_completes_before_broadcast() {
        let spy = Arc::new(Spy::default());
        let positions = service(spy.clone(), quiet_history(), vec![]);

        positions.record("a1", &report()).await.unwrap();

        assert_eq!(*spy.log.lock(), vec!["store", "publish"]);
    }

    #[tokio::test]
    async fn test_history_failure_does_not_fail_ingestion() {
        let spy = Arc::new(Spy::default());
        let mut history = MockHistory::new();
        history
            .expect_append()
            .returning(|_| Err(anyhow::anyhow!("database down")));
        let positions = service(spy.clone(), history, vec![]);

        assert!(positions.record("a1", &report()).await.is_ok());
        assert!(spy.inner.get("a1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_report_is_rejected_before_store() {
        let spy = Arc::new(Spy::default());
        let positions = service(spy.clone(), quiet_history(), vec![]);
        let mut bad = report();
        bad.latitude = 123.0;

        assert!(matches!(
            positions.record("a1", &bad).await,
            Err(PositionError::Invalid(_))
        ));
        assert!(spy.log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_lists_every_field_agent() {
        let spy = Arc::new(Spy::default());
        let agents = vec![
            AgentProfile {
                agent_id: "a1".into(),
                display_name: "Alice".into(),
                phone: Some("0600000000".into()),
            },
            AgentProfile {
                agent_id: "a2".into(),
                display_name: "Bob".into(),
                phone: None,
            },
        ];
        let positions = service(spy, quiet_history(), agents);
        positions.record("a1", &report()).await.unwrap();

        let snapshot = positions.snapshot(Utc::now()).await.unwrap();

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot[0].is_online);
        assert_eq!(snapshot[0].phone.as_deref(), Some("0600000000"));
        assert!(!snapshot[1].is_online);
        assert!(snapshot[1].position.is_none());

        let later = Utc::now() + chrono::Duration::seconds(301);
        let stale = positions.snapshot(later).await.unwrap();
        assert!(!stale[0].is_online);
    }
}
