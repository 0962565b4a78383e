/// Partner store abstraction layer
///
/// Provides the PartnerStore trait and the partner, association and backfill
/// records it persists. PostgreSQL is the production backend; the in-memory
/// backend serves tests and local experiments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::backfill::{BackfillJob, BackfillType, NewBackfillJob};
use crate::errors::PartnerError;

pub mod memory;
pub mod postgres;

pub type PartnerId = i64;

/// Why a partner is linked to a care request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Source,
    Location,
    PopHealth,
    Insurance,
    ProviderNetwork,
}

impl Origin {
    pub const ALL: [Origin; 5] = [
        Origin::Source,
        Origin::Location,
        Origin::PopHealth,
        Origin::Insurance,
        Origin::ProviderNetwork,
    ];

    /// Slug stored in care_request_partner_origins.
    pub fn slug(&self) -> &'static str {
        match self {
            Origin::Source => "source",
            Origin::Location => "location",
            Origin::PopHealth => "pop_health",
            Origin::Insurance => "insurance",
            Origin::ProviderNetwork => "provider_network",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for Origin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Origin::ALL
            .into_iter()
            .find(|origin| origin.slug() == s)
            .ok_or_else(|| format!("Unknown care request partner origin: {}", s))
    }
}

/// A partner organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partner {
    pub id: PartnerId,
    /// Station channel item id, the partner's external identifier
    pub channel_item_id: i64,
    pub name: String,
    pub latitude_e6: Option<i32>,
    pub longitude_e6: Option<i32>,
    pub insurance_package_ids: Vec<i64>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl Partner {
    pub fn is_active(&self) -> bool {
        self.deactivated_at.is_none()
    }
}

/// Persisted link between a care request and a partner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CareRequestPartner {
    pub id: i64,
    pub care_request_id: i64,
    pub partner_id: PartnerId,
    pub origin: Origin,
    pub created_at: DateTime<Utc>,
    /// Set on soft delete; active rows have None
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Inclusive latitude/longitude box in micro-degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub lat_min: i32,
    pub lat_max: i32,
    pub lng_min: i32,
    pub lng_max: i32,
}

impl BoundingBox {
    pub fn around(latitude_e6: i32, longitude_e6: i32, margin_e6: i32) -> Self {
        BoundingBox {
            lat_min: latitude_e6.saturating_sub(margin_e6),
            lat_max: latitude_e6.saturating_add(margin_e6),
            lng_min: longitude_e6.saturating_sub(margin_e6),
            lng_max: longitude_e6.saturating_add(margin_e6),
        }
    }

    pub fn contains(&self, latitude_e6: i32, longitude_e6: i32) -> bool {
        (self.lat_min..=self.lat_max).contains(&latitude_e6)
            && (self.lng_min..=self.lng_max).contains(&longitude_e6)
    }
}

/// Core abstraction for partner, association and backfill persistence.
///
/// All implementations must be Send + Sync; runners share one store across tasks.
#[async_trait]
pub trait PartnerStore: Send + Sync {
    /// Fetch a partner by internal id, including deactivated partners.
    async fn get_partner_by_id(&self, id: PartnerId) -> Result<Partner, PartnerError>;

    /// Fetch a partner by channel item id, including deactivated partners.
    async fn get_partner_by_channel_item_id(&self, channel_item_id: i64) -> Result<Partner, PartnerError>;

    /// Active partners whose channel item id is in the list.
    async fn get_partners_by_channel_item_ids(&self, channel_item_ids: &[i64]) -> Result<Vec<Partner>, PartnerError>;

    /// Active partners linked to any of the insurance packages.
    async fn get_partners_by_insurance_packages(&self, package_ids: &[i64]) -> Result<Vec<Partner>, PartnerError>;

    /// Active partners located inside the box.
    async fn search_partners_by_location(&self, bounds: BoundingBox) -> Result<Vec<Partner>, PartnerError>;

    /// Active (not soft-deleted) associations of a care request, across all origins,
    /// ordered by creation.
    async fn list_active_associations(&self, care_request_id: i64) -> Result<Vec<CareRequestPartner>, PartnerError>;

    async fn add_association(
        &self,
        care_request_id: i64,
        partner_id: PartnerId,
        origin: Origin,
    ) -> Result<CareRequestPartner, PartnerError>;

    /// Soft delete an association by id.
    async fn delete_association(&self, id: i64) -> Result<(), PartnerError>;

    /// Create a backfill job. Returns Conflict when an open job exists for the
    /// same partner and type.
    async fn add_backfill(&self, input: NewBackfillJob) -> Result<BackfillJob, PartnerError>;

    async fn get_backfill(&self, id: i64) -> Result<BackfillJob, PartnerError>;

    /// The open (not completed) job for a partner and type, if any.
    async fn get_open_backfill(
        &self,
        partner_id: PartnerId,
        backfill_type: BackfillType,
    ) -> Result<Option<BackfillJob>, PartnerError>;

    /// All jobs without completed_at, oldest first.
    async fn get_pending_backfills(&self) -> Result<Vec<BackfillJob>, PartnerError>;

    /// Persist one batch: advance the cursor (never backwards) and add the batch's
    /// matches to the running total.
    async fn record_backfill_progress(
        &self,
        id: i64,
        cursor: DateTime<Utc>,
        new_matches: i64,
    ) -> Result<BackfillJob, PartnerError>;

    /// Mark a job terminal. A job that is already complete is returned unchanged.
    async fn complete_backfill(
        &self,
        id: i64,
        error_description: Option<&str>,
    ) -> Result<BackfillJob, PartnerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_slug_round_trip() {
        for origin in Origin::ALL {
            assert_eq!(origin.slug().parse::<Origin>(), Ok(origin));
        }
        assert!("referral".parse::<Origin>().is_err());
    }

    #[test]
    fn test_bounding_box_edges_are_inclusive() {
        let bounds = BoundingBox::around(40_000_000, -105_000_000, 150);
        assert!(bounds.contains(40_000_150, -105_000_150));
        assert!(bounds.contains(39_999_850, -104_999_850));
        assert!(!bounds.contains(40_000_151, -105_000_000));
    }
}
