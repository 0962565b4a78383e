use async_trait::async_trait;
use std::sync::Arc;

use super::{partner_ids, OriginMatcher, PartnerSet};
use crate::care_request::CareRequest;
use crate::errors::PartnerError;
use crate::store::{Origin, PartnerStore};

/// Matches partners linked to any of the request's insurance packages.
pub struct InsuranceMatcher {
    store: Arc<dyn PartnerStore>,
}

impl InsuranceMatcher {
    pub fn new(store: Arc<dyn PartnerStore>) -> Self {
        InsuranceMatcher { store }
    }
}

#[async_trait]
impl OriginMatcher for InsuranceMatcher {
    fn origin(&self) -> Origin {
        Origin::Insurance
    }

    async fn desired_partners(&self, care_request: &CareRequest) -> Result<PartnerSet, PartnerError> {
        if care_request.insurance_package_ids.is_empty() {
            return Ok(PartnerSet::new());
        }
        let partners = self
            .store
            .get_partners_by_insurance_packages(&care_request.insurance_package_ids)
            .await
            .map_err(|e| PartnerError::Internal(format!("GetPartnersByInsurancePackages error: {}", e)))?;
        Ok(partner_ids(&partners))
    }
}

/// Matches partners whose channel item is one of the request's provider networks.
pub struct ProviderNetworkMatcher {
    store: Arc<dyn PartnerStore>,
}

impl ProviderNetworkMatcher {
    pub fn new(store: Arc<dyn PartnerStore>) -> Self {
        ProviderNetworkMatcher { store }
    }
}

#[async_trait]
impl OriginMatcher for ProviderNetworkMatcher {
    fn origin(&self) -> Origin {
        Origin::ProviderNetwork
    }

    async fn desired_partners(&self, care_request: &CareRequest) -> Result<PartnerSet, PartnerError> {
        if care_request.provider_network_channel_item_ids.is_empty() {
            return Ok(PartnerSet::new());
        }
        let partners = self
            .store
            .get_partners_by_channel_item_ids(&care_request.provider_network_channel_item_ids)
            .await
            .map_err(|e| PartnerError::Internal(format!("GetPartnersByStationChannelItemIDList error: {}", e)))?;
        Ok(partner_ids(&partners))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{InMemoryPartnerStore, StoreOp};
    use crate::store::Partner;

    fn partner(channel_item_id: i64, packages: Vec<i64>) -> Partner {
        Partner {
            id: 0,
            channel_item_id,
            name: format!("Partner {}", channel_item_id),
            latitude_e6: None,
            longitude_e6: None,
            insurance_package_ids: packages,
            deactivated_at: None,
        }
    }

    #[tokio::test]
    async fn test_insurance_packages_map_to_partners() {
        let store = Arc::new(InMemoryPartnerStore::new());
        let payer = store.insert_partner(partner(1, vec![500, 501])).unwrap();
        store.insert_partner(partner(2, vec![600])).unwrap();

        let matcher = InsuranceMatcher::new(store);
        let request = CareRequest {
            id: 3,
            insurance_package_ids: vec![501, 999],
            ..Default::default()
        };
        assert_eq!(
            matcher.desired_partners(&request).await.unwrap(),
            PartnerSet::from([payer.id])
        );
    }

    #[tokio::test]
    async fn test_provider_networks_map_to_partners() {
        let store = Arc::new(InMemoryPartnerStore::new());
        let network = store.insert_partner(partner(77, Vec::new())).unwrap();

        let matcher = ProviderNetworkMatcher::new(store);
        let request = CareRequest {
            id: 4,
            provider_network_channel_item_ids: vec![77, 78],
            ..Default::default()
        };
        assert_eq!(
            matcher.desired_partners(&request).await.unwrap(),
            PartnerSet::from([network.id])
        );

        let empty = CareRequest { id: 5, ..Default::default() };
        assert!(matcher.desired_partners(&empty).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_failure_is_internal() {
        let store = Arc::new(InMemoryPartnerStore::new());
        store.fail_next(StoreOp::PartnerLookup).unwrap();
        let matcher = InsuranceMatcher::new(store);
        let request = CareRequest {
            id: 6,
            insurance_package_ids: vec![1],
            ..Default::default()
        };
        assert!(matches!(
            matcher.desired_partners(&request).await,
            Err(PartnerError::Internal(_))
        ));
    }
}
