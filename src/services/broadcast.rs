use dashmap::DashMap;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::events::ServerEvent;
use crate::models::position::Role;

/// Named fan-out group.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Everything addressed to one agent, on every device they use.
    Agent(String),
    Observers,
    FieldAgents,
}

impl Channel {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Observer => Channel::Observers,
            Role::FieldAgent => Channel::FieldAgents,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Agent(id) => write!(f, "agent:{}", id),
            Channel::Observers => f.write_str("observers"),
            Channel::FieldAgents => f.write_str("field-agents"),
        }
    }
}

/// Outbound side of the hub. Publishing never blocks the caller.
pub trait BroadcastPort: Send + Sync {
    /// Returns the number of subscribers the event was queued for.
    fn publish(&self, channel: &Channel, event: ServerEvent) -> usize;
}

/// In-process channel registry backed by per-connection mpsc senders.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<Channel, Vec<(Uuid, mpsc::Sender<ServerEvent>)>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, channel: Channel, conn_id: Uuid, sender: mpsc::Sender<ServerEvent>) {
        let mut subscribers = self.channels.entry(channel).or_default();
        if !subscribers.iter().any(|(id, _)| *id == conn_id) {
            subscribers.push((conn_id, sender));
        }
    }

    /// Removes the connection from every channel it joined.
    pub fn unsubscribe_all(&self, conn_id: Uuid) {
        self.channels
            .iter_mut()
            .for_each(|mut entry| entry.value_mut().retain(|(id, _)| *id != conn_id));
        self.channels.retain(|_, subscribers| !subscribers.is_empty());
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }
}

impl BroadcastPort for ChannelRegistry {
    fn publish(&self, channel: &Channel, event: ServerEvent) -> usize {
        // Senders are cloned out so no shard lock is held while queueing.
        let targets: Vec<(Uuid, mpsc::Sender<ServerEvent>)> = match self.channels.get(channel) {
            Some(subscribers) => subscribers.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for (conn_id, sender) in targets {
            match sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(%conn_id, %channel, "outbound buffer full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(%conn_id, %channel, "subscriber gone");
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmed(point: &str) -> ServerEvent {
        ServerEvent::PointStatusConfirmed {
            point_id: point.to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_only_channel_subscribers() {
        let registry = ChannelRegistry::new();
        let (obs_tx, mut obs_rx) = mpsc::channel(4);
        let (agent_tx, mut agent_rx) = mpsc::channel(4);
        registry.subscribe(Channel::Observers, Uuid::new_v4(), obs_tx);
        registry.subscribe(Channel::FieldAgents, Uuid::new_v4(), agent_tx);

        assert_eq!(registry.publish(&Channel::Observers, confirmed("p1")), 1);

        assert_eq!(obs_rx.recv().await, Some(confirmed("p1")));
        assert!(agent_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_all_removes_every_membership() {
        let registry = ChannelRegistry::new();
        let conn = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(4);
        registry.subscribe(Channel::Agent("a1".into()), conn, tx.clone());
        registry.subscribe(Channel::FieldAgents, conn, tx);

        registry.unsubscribe_all(conn);

        assert_eq!(registry.subscriber_count(&Channel::FieldAgents), 0);
        assert_eq!(registry.publish(&Channel::Agent("a1".into()), confirmed("p")), 0);
    }

    #[test]
    fn test_full_buffer_does_not_block() {
        let registry = ChannelRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.subscribe(Channel::Observers, Uuid::new_v4(), tx);

        assert_eq!(registry.publish(&Channel::Observers, confirmed("a")), 1);
        assert_eq!(registry.publish(&Channel::Observers, confirmed("b")), 0);
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(Channel::Agent("42".into()).to_string(), "agent:42");
        assert_eq!(Channel::for_role(Role::Observer).to_string(), "observers");
        assert_eq!(Channel::for_role(Role::FieldAgent).to_string(), "field-agents");
    }
}
