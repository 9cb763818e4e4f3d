use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of an asset preparation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreparationStatus {
    Queued,
    Preparing,
    Ready,
    Active,
    ToArchive,
    OutOfService,
    Archived,
}

impl PreparationStatus {
    pub const ALL: [PreparationStatus; 7] = [
        PreparationStatus::Queued,
        PreparationStatus::Preparing,
        PreparationStatus::Ready,
        PreparationStatus::Active,
        PreparationStatus::ToArchive,
        PreparationStatus::OutOfService,
        PreparationStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PreparationStatus::Queued => "queued",
            PreparationStatus::Preparing => "preparing",
            PreparationStatus::Ready => "ready",
            PreparationStatus::Active => "active",
            PreparationStatus::ToArchive => "to-archive",
            PreparationStatus::OutOfService => "out-of-service",
            PreparationStatus::Archived => "archived",
        }
    }

    /// States an operator may archive from.
    pub fn is_archivable(&self) -> bool {
        matches!(
            self,
            PreparationStatus::ToArchive | PreparationStatus::Ready | PreparationStatus::Active
        )
    }
}

impl fmt::Display for PreparationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PreparationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PreparationStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown preparation status: {}", s))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreparationRecord {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub event_date: NaiveDate,
    pub status: PreparationStatus,
    pub archived_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PreparationRecord {
    pub fn new(asset_id: Uuid, event_date: NaiveDate, status: PreparationStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            asset_id,
            event_date,
            status,
            archived_at: None,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_round_trip() {
        for status in PreparationStatus::ALL {
            assert_eq!(status.as_str().parse::<PreparationStatus>(), Ok(status));
        }
        assert!("retired".parse::<PreparationStatus>().is_err());
    }

    #[test]
    fn test_archivable_states() {
        assert!(PreparationStatus::ToArchive.is_archivable());
        assert!(PreparationStatus::Ready.is_archivable());
        assert!(PreparationStatus::Active.is_archivable());
        assert!(!PreparationStatus::Queued.is_archivable());
        assert!(!PreparationStatus::OutOfService.is_archivable());
        assert!(!PreparationStatus::Archived.is_archivable());
    }
}
