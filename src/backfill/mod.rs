/// Resumable partner association backfills.
///
/// A backfill job walks every care request created inside its window in
/// creation order and recomputes the job partner's associations for each one.
/// Progress is persisted after every batch so a restarted process resumes from
/// the last cursor instead of the window start.
///
/// - `BackfillJob` is the persisted record and its state machine.
/// - `runner` drives one job to a terminal state.
/// - `queue` hands explicitly started jobs to background runners.
/// - `scheduler` validates new jobs and sweeps unfinished ones.

pub mod queue;
pub mod runner;
pub mod scheduler;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of backfill, stored as a slug in the backfill_types table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillType {
    #[serde(rename = "pophealth")]
    PopHealth,
    ProviderNetwork,
}

impl BackfillType {
    pub fn slug(&self) -> &'static str {
        match self {
            BackfillType::PopHealth => "pophealth",
            BackfillType::ProviderNetwork => "provider_network",
        }
    }

    /// Whether a runner exists for this type.
    pub fn is_runnable(&self) -> bool {
        matches!(self, BackfillType::PopHealth)
    }
}

impl fmt::Display for BackfillType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for BackfillType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pophealth" | "pop_health" => Ok(BackfillType::PopHealth),
            "provider_network" => Ok(BackfillType::ProviderNetwork),
            other => Err(format!("Unknown backfill type: {}", other)),
        }
    }
}

/// Terminal outcome reported to the population health service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackfillStatus {
    Processed,
    Failed,
}

impl fmt::Display for BackfillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackfillStatus::Processed => write!(f, "processed"),
            BackfillStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle position of a job, derived from its persisted columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillState {
    /// Created, no batch persisted yet
    Pending,
    /// At least one batch persisted, cursor set
    InProgress,
    Completed(BackfillStatus),
}

/// Persisted progress record for one (partner, backfill type) backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillJob {
    pub id: i64,
    pub partner_id: i64,
    pub backfill_type: BackfillType,
    pub start_date: DateTime<Utc>,
    /// Exclusive end of the window
    pub end_date: DateTime<Utc>,
    /// Creation time of the first care request not yet processed
    pub last_processed_cursor: Option<DateTime<Utc>>,
    pub number_of_matches: i64,
    pub error_description: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackfillJob {
    pub fn state(&self) -> BackfillState {
        match (self.completed_at, &self.error_description, self.last_processed_cursor) {
            (Some(_), Some(_), _) => BackfillState::Completed(BackfillStatus::Failed),
            (Some(_), None, _) => BackfillState::Completed(BackfillStatus::Processed),
            (None, _, Some(_)) => BackfillState::InProgress,
            (None, _, None) => BackfillState::Pending,
        }
    }

    pub fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }

    /// Lower bound of the next batch window.
    pub fn resume_from(&self) -> DateTime<Utc> {
        self.last_processed_cursor.unwrap_or(self.start_date)
    }
}

/// Input for creating a backfill job row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBackfillJob {
    pub partner_id: i64,
    pub backfill_type: BackfillType,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job() -> BackfillJob {
        let start = Utc.with_ymd_and_hms(2023, 1, 30, 0, 0, 0).unwrap();
        BackfillJob {
            id: 1,
            partner_id: 2,
            backfill_type: BackfillType::PopHealth,
            start_date: start,
            end_date: Utc.with_ymd_and_hms(2023, 1, 31, 0, 0, 0).unwrap(),
            last_processed_cursor: None,
            number_of_matches: 0,
            error_description: None,
            completed_at: None,
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn test_state_transitions() {
        let mut job = job();
        assert_eq!(job.state(), BackfillState::Pending);
        assert_eq!(job.resume_from(), job.start_date);

        let cursor = Utc.with_ymd_and_hms(2023, 1, 30, 12, 0, 0).unwrap();
        job.last_processed_cursor = Some(cursor);
        assert_eq!(job.state(), BackfillState::InProgress);
        assert_eq!(job.resume_from(), cursor);

        job.completed_at = Some(Utc::now());
        assert_eq!(job.state(), BackfillState::Completed(BackfillStatus::Processed));
        assert!(!job.is_open());

        job.error_description = Some("listing failed".to_string());
        assert_eq!(job.state(), BackfillState::Completed(BackfillStatus::Failed));
    }

    #[test]
    fn test_backfill_type_slugs() {
        assert_eq!("pophealth".parse::<BackfillType>(), Ok(BackfillType::PopHealth));
        assert_eq!(
            "provider_network".parse::<BackfillType>(),
            Ok(BackfillType::ProviderNetwork)
        );
        assert!("unspecified".parse::<BackfillType>().is_err());
        assert_eq!(BackfillType::PopHealth.to_string(), "pophealth");
        assert!(!BackfillType::ProviderNetwork.is_runnable());
    }
}
