//! Messages exchanged over a hub connection.
//!
//! Frames are JSON objects of the form `{"event": "<name>", "data": {...}}`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::position::{AgentPosition, AgentSnapshot, PositionReport};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointStatusChange {
    pub point_id: String,
    pub status: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncidentReport {
    #[serde(default)]
    pub point_id: Option<String>,
    pub category: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reassignment {
    pub point_id: String,
    pub from_agent_id: String,
    pub to_agent_id: String,
}

/// Inbound, client to hub.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    PositionUpdate(PositionReport),
    PointStatusChanged(PointStatusChange),
    IncidentReported(IncidentReport),
    ReassignmentRequested(Reassignment),
    AllPositions,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::PositionUpdate(_) => "position-update",
            ClientEvent::PointStatusChanged(_) => "point-status-changed",
            ClientEvent::IncidentReported(_) => "incident-reported",
            ClientEvent::ReassignmentRequested(_) => "reassignment-requested",
            ClientEvent::AllPositions => "all-positions",
        }
    }
}

/// Outbound, hub to client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    PositionBroadcast {
        agent_id: String,
        position: AgentPosition,
    },
    PointStatusChanged {
        agent_id: String,
        change: PointStatusChange,
    },
    PointStatusConfirmed {
        point_id: String,
    },
    IncidentReported {
        agent_id: String,
        incident_id: Uuid,
        incident: IncidentReport,
    },
    IncidentReceived {
        incident_id: Uuid,
    },
    ReassignmentRequested {
        requested_by: String,
        reassignment: Reassignment,
    },
    ReassignmentConfirmed {
        point_id: String,
    },
    AllPositions {
        positions: Vec<AgentSnapshot>,
    },
    Error {
        message: String,
    },
}
