use async_trait::async_trait;
use std::sync::Arc;

use super::{partner_ids, OriginMatcher, PartnerSet};
use crate::care_request::CareRequest;
use crate::errors::PartnerError;
use crate::store::{BoundingBox, Origin, PartnerStore};

/// Half-width of the search box around the request, in micro-degrees.
pub const LAT_LNG_MARGIN_E6: i32 = 150;

/// Matches partners located within a small box around the care request.
pub struct LocationMatcher {
    store: Arc<dyn PartnerStore>,
}

impl LocationMatcher {
    pub fn new(store: Arc<dyn PartnerStore>) -> Self {
        LocationMatcher { store }
    }
}

#[async_trait]
impl OriginMatcher for LocationMatcher {
    fn origin(&self) -> Origin {
        Origin::Location
    }

    async fn desired_partners(&self, care_request: &CareRequest) -> Result<PartnerSet, PartnerError> {
        let geo = care_request
            .location
            .filter(|g| g.latitude_e6 != 0 && g.longitude_e6 != 0)
            .ok_or_else(|| PartnerError::invalid("location", "location matching requires a lat and lng"))?;

        let bounds = BoundingBox::around(geo.latitude_e6, geo.longitude_e6, LAT_LNG_MARGIN_E6);
        let partners = self
            .store
            .search_partners_by_location(bounds)
            .await
            .map_err(|e| PartnerError::Internal(format!("SearchPartnersByLatLng error: {}", e)))?;

        Ok(partner_ids(&partners))
    }
}
