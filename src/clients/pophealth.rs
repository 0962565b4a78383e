/// Population health service client
///
/// Implements patient search and backfill status reporting against the
/// population health JSON API.

use async_trait::async_trait;
use std::time::Duration;

use super::{
    error_for_status, BackfillStatusReport, BackfillStatusReporter, MatchedPatient, PatientQuery,
    PatientSearch,
};
use crate::errors::PartnerError;

#[derive(serde::Deserialize)]
struct SearchPatientResponse {
    #[serde(default)]
    patient: Vec<MatchedPatient>,
}

pub struct PopHealthClient {
    client: reqwest::Client,
    base_url: String,
}

impl PopHealthClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PartnerError> {
        if base_url.trim().is_empty() {
            return Err(PartnerError::Config(
                "population health base URL is required. \
                 Set PARTNERLINK_SERVICES__POPHEALTH_BASE_URL or services.pophealth_base_url in partnerlink.toml"
                    .to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PartnerError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(PopHealthClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PatientSearch for PopHealthClient {
    async fn search_patients(&self, query: &PatientQuery) -> Result<Vec<MatchedPatient>, PartnerError> {
        let response = self
            .client
            .post(format!("{}/v1/patients:search", self.base_url))
            .json(query)
            .send()
            .await
            .map_err(|e| PartnerError::Internal(format!("SearchPatient request failed: {}", e)))?;

        let response = error_for_status("population health service", response).await?;
        let body: SearchPatientResponse = response
            .json()
            .await
            .map_err(|e| PartnerError::Internal(format!("Failed to parse SearchPatient response: {}", e)))?;

        Ok(body.patient)
    }
}

#[async_trait]
impl BackfillStatusReporter for PopHealthClient {
    async fn report(&self, report: &BackfillStatusReport) -> Result<(), PartnerError> {
        let response = self
            .client
            .post(format!("{}/v1/backfills:status", self.base_url))
            .json(report)
            .send()
            .await
            .map_err(|e| PartnerError::Internal(format!("UpdateBackfillFileStatus request failed: {}", e)))?;

        error_for_status("population health service", response).await?;
        Ok(())
    }
}
