/// Origin-based partner matching.
///
/// Each origin has one matcher that turns the care request signals relevant to
/// that origin into the set of partner ids the request should be associated
/// with. Matchers only read; reconciliation applies the result.

pub mod location;
pub mod lookup;
pub mod pophealth;
pub mod source;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::care_request::CareRequest;
use crate::clients::PatientSearch;
use crate::errors::PartnerError;
use crate::store::{Origin, Partner, PartnerId, PartnerStore};

pub use location::LocationMatcher;
pub use lookup::{InsuranceMatcher, ProviderNetworkMatcher};
pub use pophealth::{PopHealthMatcher, PopHealthScope};
pub use source::SourceMatcher;

/// Desired partners for one (care request, origin), ordered for stable output.
pub type PartnerSet = BTreeSet<PartnerId>;

#[async_trait]
pub trait OriginMatcher: Send + Sync {
    fn origin(&self) -> Origin;

    async fn desired_partners(&self, care_request: &CareRequest) -> Result<PartnerSet, PartnerError>;
}

pub(crate) fn partner_ids(partners: &[Partner]) -> PartnerSet {
    partners.iter().map(|p| p.id).collect()
}

/// One matcher per origin, selected by `Origin`.
pub struct Matchers {
    source: SourceMatcher,
    location: LocationMatcher,
    pop_health: Arc<PopHealthMatcher>,
    insurance: InsuranceMatcher,
    provider_network: ProviderNetworkMatcher,
}

impl Matchers {
    pub fn new(store: Arc<dyn PartnerStore>, patient_search: Arc<dyn PatientSearch>) -> Self {
        Matchers {
            source: SourceMatcher::new(store.clone()),
            location: LocationMatcher::new(store.clone()),
            pop_health: Arc::new(PopHealthMatcher::new(store.clone(), patient_search)),
            insurance: InsuranceMatcher::new(store.clone()),
            provider_network: ProviderNetworkMatcher::new(store),
        }
    }

    pub fn for_origin(&self, origin: Origin) -> &dyn OriginMatcher {
        match origin {
            Origin::Source => &self.source,
            Origin::Location => &self.location,
            Origin::PopHealth => self.pop_health.as_ref(),
            Origin::Insurance => &self.insurance,
            Origin::ProviderNetwork => &self.provider_network,
        }
    }

    /// Shared handle for backfill runners, which scope their searches.
    pub fn pop_health(&self) -> Arc<PopHealthMatcher> {
        self.pop_health.clone()
    }
}
