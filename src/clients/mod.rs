/// Remote capabilities the matchers and backfill runners depend on.
///
/// Each capability is a trait so runners can be driven by HTTP clients in
/// production and by scripted fakes in tests:
/// - `CareRequestSource`: time-windowed, creation-ordered care request listing
/// - `PatientSearch`: population health patient search by demographics
/// - `BackfillStatusReporter`: terminal backfill status notifications

pub mod episode;
pub mod pophealth;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::backfill::BackfillStatus;
use crate::care_request::CareRequest;
use crate::errors::PartnerError;

/// Listing request for care requests created in `[created_from, created_before)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CareRequestWindow {
    pub created_from: DateTime<Utc>,
    pub created_before: DateTime<Utc>,
    pub max_results: u32,
    pub include_patient: bool,
}

#[async_trait]
pub trait CareRequestSource: Send + Sync {
    /// Care requests in the window, ascending by creation time, at most `max_results`.
    async fn list_care_requests(&self, window: &CareRequestWindow) -> Result<Vec<CareRequest>, PartnerError>;
}

/// Demographic patient search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientQuery {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssn: Option<String>,
    /// Upstream patient id; used as the read-once cache key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    /// Restrict matches to these partner channel items; empty means all
    #[serde(default)]
    pub channel_item_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<u32>,
    #[serde(default)]
    pub is_backfill: bool,
}

/// A population health patient record; only the owning channel item matters here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedPatient {
    #[serde(default)]
    pub id: Option<String>,
    pub channel_item_id: i64,
}

#[async_trait]
pub trait PatientSearch: Send + Sync {
    async fn search_patients(&self, query: &PatientQuery) -> Result<Vec<MatchedPatient>, PartnerError>;
}

/// Terminal status notification for a partner's backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillStatusReport {
    pub channel_item_id: i64,
    pub number_of_matches: i64,
    pub status: BackfillStatus,
}

#[async_trait]
pub trait BackfillStatusReporter: Send + Sync {
    async fn report(&self, report: &BackfillStatusReport) -> Result<(), PartnerError>;
}

/// Turn a non-success HTTP response into an Internal error carrying status and body.
pub(crate) async fn error_for_status(
    service: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, PartnerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    Err(PartnerError::Internal(format!(
        "{} returned status {}: {}",
        service,
        status.as_u16(),
        body
    )))
}
