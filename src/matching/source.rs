use async_trait::async_trait;
use std::sync::Arc;

use super::{OriginMatcher, PartnerSet};
use crate::care_request::CareRequest;
use crate::errors::PartnerError;
use crate::store::{Origin, PartnerStore};

/// Matches the single partner behind the channel item the request came through.
pub struct SourceMatcher {
    store: Arc<dyn PartnerStore>,
}

impl SourceMatcher {
    pub fn new(store: Arc<dyn PartnerStore>) -> Self {
        SourceMatcher { store }
    }
}

#[async_trait]
impl OriginMatcher for SourceMatcher {
    fn origin(&self) -> Origin {
        Origin::Source
    }

    async fn desired_partners(&self, care_request: &CareRequest) -> Result<PartnerSet, PartnerError> {
        let channel_item_id = care_request
            .channel_item_id
            .ok_or_else(|| PartnerError::invalid("channel_item_id", "source matching requires a channel item id"))?;

        let partner = self
            .store
            .get_partner_by_channel_item_id(channel_item_id)
            .await
            .map_err(|e| match e {
                PartnerError::NotFound { .. } => PartnerError::InvalidInput {
                    message: format!("no partner found for channel item id {}", channel_item_id),
                    field: Some("channel_item_id".to_string()),
                },
                other => PartnerError::Internal(format!("GetPartnerByStationChannelItemID error: {}", other)),
            })?;

        if !partner.is_active() {
            return Err(PartnerError::FailedPrecondition(format!(
                "source partner with channel item id {} was deactivated",
                channel_item_id
            )));
        }

        Ok(PartnerSet::from([partner.id]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryPartnerStore;
    use crate::store::Partner;
    use chrono::Utc;

    fn partner(channel_item_id: i64, deactivated: bool) -> Partner {
        Partner {
            id: 0,
            channel_item_id,
            name: format!("Partner {}", channel_item_id),
            latitude_e6: None,
            longitude_e6: None,
            insurance_package_ids: Vec::new(),
            deactivated_at: deactivated.then(Utc::now),
        }
    }

    fn request(channel_item_id: i64) -> CareRequest {
        CareRequest {
            id: 5,
            channel_item_id: Some(channel_item_id),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_matches_single_partner() {
        let store = Arc::new(InMemoryPartnerStore::new());
        let p = store.insert_partner(partner(900, false)).unwrap();
        let matcher = SourceMatcher::new(store);

        let desired = matcher.desired_partners(&request(900)).await.unwrap();
        assert_eq!(desired, PartnerSet::from([p.id]));
    }

    #[tokio::test]
    async fn test_unknown_channel_is_invalid_input() {
        let matcher = SourceMatcher::new(Arc::new(InMemoryPartnerStore::new()));
        assert!(matches!(
            matcher.desired_partners(&request(1)).await,
            Err(PartnerError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn test_deactivated_partner_fails_precondition() {
        let store = Arc::new(InMemoryPartnerStore::new());
        store.insert_partner(partner(901, true)).unwrap();
        let matcher = SourceMatcher::new(store);
        assert!(matches!(
            matcher.desired_partners(&request(901)).await,
            Err(PartnerError::FailedPrecondition(_))
        ));
    }
}
