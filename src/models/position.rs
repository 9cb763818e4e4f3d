use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::geo::Coordinate;

/// Positions older than this are considered stale.
pub const FRESHNESS_WINDOW_SECS: i64 = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Observer,
    FieldAgent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Observer => "observer",
            Role::FieldAgent => "field-agent",
        }
    }
}

/// Who is on the other end of a connection or request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub agent_id: String,
    pub role: Role,
}

/// A single fix as sent by a field device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl PositionReport {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.coordinate().is_valid() {
            return Err(format!(
                "coordinate out of range: {}, {}",
                self.latitude, self.longitude
            ));
        }
        for (name, value) in [
            ("accuracy", self.accuracy),
            ("speed", self.speed),
            ("heading", self.heading),
        ] {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(format!("{} is not a finite number", name));
                }
            }
        }
        Ok(())
    }
}

/// Latest known position of an agent, as held in the ephemeral store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentPosition {
    pub agent_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl AgentPosition {
    pub fn from_report(agent_id: &str, report: &PositionReport, received_at: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            latitude: report.latitude,
            longitude: report.longitude,
            accuracy: report.accuracy,
            speed: report.speed,
            heading: report.heading,
            timestamp: report.timestamp,
            received_at,
        }
    }

    pub fn is_online_at(&self, now: DateTime<Utc>) -> bool {
        now - self.received_at < Duration::seconds(FRESHNESS_WINDOW_SECS)
    }
}

/// Static directory data for a field agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: String,
    pub display_name: String,
    pub phone: Option<String>,
}

/// One row of the "all current positions" view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub display_name: String,
    pub phone: Option<String>,
    pub position: Option<AgentPosition>,
    pub is_online: bool,
}
