//! Live position broadcast hub.
//!
//! Every connection gets an id, an identity and an outbound mpsc channel.
//! Inbound events are dispatched here; outbound events reach the socket task
//! through the channel registry.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::broadcast::{BroadcastPort, Channel, ChannelRegistry};
use super::positions::{PositionError, PositionService};
use crate::models::events::{ClientEvent, ServerEvent};
use crate::models::position::{Identity, Role};

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("unknown connection {0}")]
    UnknownConnection(Uuid),

    #[error("{event} is not allowed for role {role}")]
    Forbidden { event: &'static str, role: &'static str },

    #[error(transparent)]
    Position(#[from] PositionError),
}

/// Handle returned to the socket task.
pub struct Connection {
    pub id: Uuid,
    pub identity: Identity,
    pub outbound: mpsc::Receiver<ServerEvent>,
}

pub struct Hub {
    registry: Arc<ChannelRegistry>,
    positions: PositionService,
    connections: DashMap<Uuid, (Identity, mpsc::Sender<ServerEvent>)>,
    outbound_buffer: usize,
}

impl Hub {
    pub fn new(registry: Arc<ChannelRegistry>, positions: PositionService, outbound_buffer: usize) -> Self {
        Self {
            registry,
            positions,
            connections: DashMap::new(),
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    pub fn connect(&self, identity: Identity) -> Connection {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.outbound_buffer);

        self.registry
            .subscribe(Channel::Agent(identity.agent_id.clone()), id, tx.clone());
        self.registry
            .subscribe(Channel::for_role(identity.role), id, tx.clone());
        self.connections.insert(id, (identity.clone(), tx));

        tracing::info!(
            conn_id = %id,
            agent_id = %identity.agent_id,
            role = identity.role.as_str(),
            "hub connection opened"
        );
        Connection {
            id,
            identity,
            outbound: rx,
        }
    }

    /// Position state is left to expire on its own.
    pub fn disconnect(&self, conn_id: Uuid) {
        self.registry.unsubscribe_all(conn_id);
        if let Some((_, (identity, _))) = self.connections.remove(&conn_id) {
            tracing::info!(
                conn_id = %conn_id,
                agent_id = %identity.agent_id,
                role = identity.role.as_str(),
                "hub connection closed"
            );
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub async fn dispatch(&self, conn_id: Uuid, event: ClientEvent) -> Result<(), HubError> {
        let (identity, reply) = self
            .connections
            .get(&conn_id)
            .map(|entry| entry.value().clone())
            .ok_or(HubError::UnknownConnection(conn_id))?;

        let name = event.name();
        match event {
            ClientEvent::PositionUpdate(report) => {
                require(&identity, Role::FieldAgent, name)?;
                self.positions.record(&identity.agent_id, &report).await?;
            }
            ClientEvent::AllPositions => {
                require(&identity, Role::Observer, name)?;
                let positions = self.positions.snapshot(Utc::now()).await?;
                send(&reply, conn_id, ServerEvent::AllPositions { positions });
            }
            ClientEvent::PointStatusChanged(change) => {
                require(&identity, Role::FieldAgent, name)?;
                let point_id = change.point_id.clone();
                self.registry.publish(
                    &Channel::Observers,
                    ServerEvent::PointStatusChanged {
                        agent_id: identity.agent_id.clone(),
                        change,
                    },
                );
                send(&reply, conn_id, ServerEvent::PointStatusConfirmed { point_id });
            }
            ClientEvent::IncidentReported(incident) => {
                require(&identity, Role::FieldAgent, name)?;
                let incident_id = Uuid::new_v4();
                self.registry.publish(
                    &Channel::Observers,
                    ServerEvent::IncidentReported {
                        agent_id: identity.agent_id.clone(),
                        incident_id,
                        incident,
                    },
                );
                tracing::info!(agent_id = %identity.agent_id, %incident_id, "incident reported");
                send(&reply, conn_id, ServerEvent::IncidentReceived { incident_id });
            }
            ClientEvent::ReassignmentRequested(reassignment) => {
                require(&identity, Role::Observer, name)?;
                let point_id = reassignment.point_id.clone();
                let event = ServerEvent::ReassignmentRequested {
                    requested_by: identity.agent_id.clone(),
                    reassignment: reassignment.clone(),
                };
                self.registry
                    .publish(&Channel::Agent(reassignment.from_agent_id.clone()), event.clone());
                if reassignment.to_agent_id != reassignment.from_agent_id {
                    self.registry
                        .publish(&Channel::Agent(reassignment.to_agent_id.clone()), event);
                }
                send(&reply, conn_id, ServerEvent::ReassignmentConfirmed { point_id });
            }
        }
        Ok(())
    }
}

fn require(identity: &Identity, role: Role, event: &'static str) -> Result<(), HubError> {
    if identity.role == role {
        Ok(())
    } else {
        Err(HubError::Forbidden {
            event,
            role: identity.role.as_str(),
        })
    }
}

fn send(reply: &mpsc::Sender<ServerEvent>, conn_id: Uuid, event: ServerEvent) {
    if let Err(e) = reply.try_send(event) {
        tracing::warn!(%conn_id, error = %e, "reply dropped");
    }
}
