/// Episode service client
///
/// Lists care requests by creation window over the episode service's JSON API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::{error_for_status, CareRequestSource, CareRequestWindow};
use crate::care_request::CareRequest;
use crate::errors::PartnerError;

#[derive(serde::Serialize)]
struct TimeWindow {
    start_datetime: DateTime<Utc>,
    end_datetime: DateTime<Utc>,
}

/// Request body for the list endpoint
#[derive(serde::Serialize)]
struct ListVisitsRequest {
    created_at_time_window: TimeWindow,
    max_visits: u32,
    include_patient: bool,
    sort_order: &'static str,
}

#[derive(serde::Deserialize)]
struct ListVisitsResponse {
    #[serde(default)]
    care_requests: Vec<CareRequest>,
}

pub struct EpisodeClient {
    client: reqwest::Client,
    base_url: String,
}

impl EpisodeClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PartnerError> {
        if base_url.trim().is_empty() {
            return Err(PartnerError::Config(
                "episode service base URL is required. \
                 Set PARTNERLINK_SERVICES__EPISODE_BASE_URL or services.episode_base_url in partnerlink.toml"
                    .to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PartnerError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(EpisodeClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CareRequestSource for EpisodeClient {
    async fn list_care_requests(&self, window: &CareRequestWindow) -> Result<Vec<CareRequest>, PartnerError> {
        let request = ListVisitsRequest {
            created_at_time_window: TimeWindow {
                start_datetime: window.created_from,
                end_datetime: window.created_before,
            },
            max_visits: window.max_results,
            include_patient: window.include_patient,
            sort_order: "created_at",
        };

        let response = self
            .client
            .post(format!("{}/v1/care-requests:list", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| PartnerError::Internal(format!("ListVisits request failed: {}", e)))?;

        let response = error_for_status("episode service", response).await?;
        let body: ListVisitsResponse = response
            .json()
            .await
            .map_err(|e| PartnerError::Internal(format!("Failed to parse ListVisits response: {}", e)))?;

        Ok(body.care_requests)
    }
}
