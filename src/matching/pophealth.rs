/// Population health matching
///
/// Searches the population health service for the care request's patient and
/// maps every returned patient record to the partner owning its channel item.

use async_trait::async_trait;
use std::sync::Arc;

use super::{partner_ids, OriginMatcher, PartnerSet};
use crate::care_request::CareRequest;
use crate::clients::{PatientQuery, PatientSearch};
use crate::errors::PartnerError;
use crate::store::{Origin, PartnerStore};

/// Upper bound on patient records requested during a backfill search.
pub const BACKFILL_MAX_RESULTS: u32 = 100;

/// Which partners a population health search may match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopHealthScope {
    /// Interactive matching across every partner
    AllPartners,
    /// Backfill matching restricted to one partner's channel item
    Backfill { channel_item_id: i64 },
}

pub struct PopHealthMatcher {
    store: Arc<dyn PartnerStore>,
    patient_search: Arc<dyn PatientSearch>,
}

impl PopHealthMatcher {
    pub fn new(store: Arc<dyn PartnerStore>, patient_search: Arc<dyn PatientSearch>) -> Self {
        PopHealthMatcher { store, patient_search }
    }

    pub async fn desired_partners_scoped(
        &self,
        care_request: &CareRequest,
        scope: PopHealthScope,
    ) -> Result<PartnerSet, PartnerError> {
        let demographics = care_request.demographics().ok_or_else(|| {
            PartnerError::invalid(
                "patient",
                "pop health matching requires a patient with given name, family name and date of birth",
            )
        })?;

        let mut query = PatientQuery {
            first_name: demographics.given_name.to_string(),
            last_name: demographics.family_name.to_string(),
            date_of_birth: demographics.date_of_birth,
            ssn: demographics.ssn.map(str::to_string),
            patient_id: demographics.external_id.map(str::to_string),
            channel_item_ids: Vec::new(),
            max_results: None,
            is_backfill: false,
        };
        if let PopHealthScope::Backfill { channel_item_id } = scope {
            query.channel_item_ids = vec![channel_item_id];
            query.max_results = Some(BACKFILL_MAX_RESULTS);
            query.is_backfill = true;
        }

        let patients = self
            .patient_search
            .search_patients(&query)
            .await
            .map_err(|e| PartnerError::Internal(format!("SearchPatient error: {}", e)))?;
        if patients.is_empty() {
            return Ok(PartnerSet::new());
        }

        let mut channel_item_ids: Vec<i64> = patients.iter().map(|p| p.channel_item_id).collect();
        channel_item_ids.sort_unstable();
        channel_item_ids.dedup();

        let partners = self
            .store
            .get_partners_by_channel_item_ids(&channel_item_ids)
            .await
            .map_err(|e| PartnerError::Internal(format!("GetPartnersByStationChannelItemIDList error: {}", e)))?;

        if partners.len() != channel_item_ids.len() {
            tracing::warn!(
                care_request_id = care_request.id,
                channel_items = channel_item_ids.len(),
                partners_found = partners.len(),
                "Some population health channel items have no active partner"
            );
        }

        Ok(partner_ids(&partners))
    }
}

#[async_trait]
impl OriginMatcher for PopHealthMatcher {
    fn origin(&self) -> Origin {
        Origin::PopHealth
    }

    async fn desired_partners(&self, care_request: &CareRequest) -> Result<PartnerSet, PartnerError> {
        self.desired_partners_scoped(care_request, PopHealthScope::AllPartners)
            .await
    }
}
