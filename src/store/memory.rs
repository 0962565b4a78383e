/// In-memory implementation of PartnerStore
///
/// Mirrors the PostgreSQL semantics (soft deletes, the one-open-backfill rule,
/// monotonic cursors) over a mutex-guarded state. Used by the test suites and
/// for running the engine without a database.
///
/// Individual operations can be armed to fail once via `fail_next`, which lets
/// callers exercise persistence-failure paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Mutex;

use crate::backfill::{BackfillJob, BackfillType, NewBackfillJob};
use crate::errors::PartnerError;
use crate::store::{BoundingBox, CareRequestPartner, Origin, Partner, PartnerId, PartnerStore};

/// Store operations that can be armed to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    ListAssociations,
    AddAssociation,
    DeleteAssociation,
    PartnerLookup,
    AddBackfill,
    RecordProgress,
    CompleteBackfill,
    PendingBackfills,
}

#[derive(Default)]
struct State {
    partners: Vec<Partner>,
    associations: Vec<CareRequestPartner>,
    backfills: Vec<BackfillJob>,
    next_id: i64,
    armed_failures: HashSet<StoreOp>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn take_failure(&mut self, op: StoreOp) -> Result<(), PartnerError> {
        if self.armed_failures.remove(&op) {
            return Err(PartnerError::Storage(format!("injected {:?} failure", op)));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryPartnerStore {
    state: Mutex<State>,
}

impl InMemoryPartnerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, PartnerError> {
        self.state
            .lock()
            .map_err(|_| PartnerError::Internal("in-memory store lock poisoned".to_string()))
    }

    /// Insert a partner; its id is assigned by the store.
    pub fn insert_partner(&self, mut partner: Partner) -> Result<Partner, PartnerError> {
        let mut state = self.lock()?;
        partner.id = state.next_id();
        state.partners.push(partner.clone());
        Ok(partner)
    }

    /// Make the next call of `op` return a storage error.
    pub fn fail_next(&self, op: StoreOp) -> Result<(), PartnerError> {
        self.lock()?.armed_failures.insert(op);
        Ok(())
    }

    /// Every association row ever written, soft-deleted ones included.
    pub fn all_associations(&self) -> Result<Vec<CareRequestPartner>, PartnerError> {
        Ok(self.lock()?.associations.clone())
    }

    pub fn all_backfills(&self) -> Result<Vec<BackfillJob>, PartnerError> {
        Ok(self.lock()?.backfills.clone())
    }

    fn active_partners<F>(&self, predicate: F) -> Result<Vec<Partner>, PartnerError>
    where
        F: Fn(&Partner) -> bool,
    {
        let mut state = self.lock()?;
        state.take_failure(StoreOp::PartnerLookup)?;
        Ok(state
            .partners
            .iter()
            .filter(|p| p.is_active() && predicate(p))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PartnerStore for InMemoryPartnerStore {
    async fn get_partner_by_id(&self, id: PartnerId) -> Result<Partner, PartnerError> {
        let mut state = self.lock()?;
        state.take_failure(StoreOp::PartnerLookup)?;
        state
            .partners
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| PartnerError::not_found("Partner", id))
    }

    async fn get_partner_by_channel_item_id(&self, channel_item_id: i64) -> Result<Partner, PartnerError> {
        let mut state = self.lock()?;
        state.take_failure(StoreOp::PartnerLookup)?;
        state
            .partners
            .iter()
            .find(|p| p.channel_item_id == channel_item_id)
            .cloned()
            .ok_or_else(|| PartnerError::not_found("Partner with channel item id", channel_item_id))
    }

    async fn get_partners_by_channel_item_ids(&self, channel_item_ids: &[i64]) -> Result<Vec<Partner>, PartnerError> {
        self.active_partners(|p| channel_item_ids.contains(&p.channel_item_id))
    }

    async fn get_partners_by_insurance_packages(&self, package_ids: &[i64]) -> Result<Vec<Partner>, PartnerError> {
        self.active_partners(|p| p.insurance_package_ids.iter().any(|id| package_ids.contains(id)))
    }

    async fn search_partners_by_location(&self, bounds: BoundingBox) -> Result<Vec<Partner>, PartnerError> {
        self.active_partners(|p| match (p.latitude_e6, p.longitude_e6) {
            (Some(lat), Some(lng)) => bounds.contains(lat, lng),
            _ => false,
        })
    }

    async fn list_active_associations(&self, care_request_id: i64) -> Result<Vec<CareRequestPartner>, PartnerError> {
        let mut state = self.lock()?;
        state.take_failure(StoreOp::ListAssociations)?;
        Ok(state
            .associations
            .iter()
            .filter(|a| a.care_request_id == care_request_id && a.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn add_association(
        &self,
        care_request_id: i64,
        partner_id: PartnerId,
        origin: Origin,
    ) -> Result<CareRequestPartner, PartnerError> {
        let mut state = self.lock()?;
        state.take_failure(StoreOp::AddAssociation)?;
        let association = CareRequestPartner {
            id: state.next_id(),
            care_request_id,
            partner_id,
            origin,
            created_at: Utc::now(),
            deleted_at: None,
        };
        state.associations.push(association.clone());
        Ok(association)
    }

    async fn delete_association(&self, id: i64) -> Result<(), PartnerError> {
        let mut state = self.lock()?;
        state.take_failure(StoreOp::DeleteAssociation)?;
        let association = state
            .associations
            .iter_mut()
            .find(|a| a.id == id && a.deleted_at.is_none())
            .ok_or_else(|| PartnerError::not_found("Care request partner", id))?;
        association.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn add_backfill(&self, input: NewBackfillJob) -> Result<BackfillJob, PartnerError> {
        let mut state = self.lock()?;
        state.take_failure(StoreOp::AddBackfill)?;
        let open_exists = state.backfills.iter().any(|b| {
            b.partner_id == input.partner_id && b.backfill_type == input.backfill_type && b.is_open()
        });
        if open_exists {
            return Err(PartnerError::Conflict(format!(
                "backfill is already in progress for partner {} and type {}",
                input.partner_id, input.backfill_type
            )));
        }
        let now = Utc::now();
        let job = BackfillJob {
            id: state.next_id(),
            partner_id: input.partner_id,
            backfill_type: input.backfill_type,
            start_date: input.start_date,
            end_date: input.end_date,
            last_processed_cursor: None,
            number_of_matches: 0,
            error_description: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        state.backfills.push(job.clone());
        Ok(job)
    }

    async fn get_backfill(&self, id: i64) -> Result<BackfillJob, PartnerError> {
        let state = self.lock()?;
        state
            .backfills
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| PartnerError::not_found("Backfill", id))
    }

    async fn get_open_backfill(
        &self,
        partner_id: PartnerId,
        backfill_type: BackfillType,
    ) -> Result<Option<BackfillJob>, PartnerError> {
        let state = self.lock()?;
        Ok(state
            .backfills
            .iter()
            .find(|b| b.partner_id == partner_id && b.backfill_type == backfill_type && b.is_open())
            .cloned())
    }

    async fn get_pending_backfills(&self) -> Result<Vec<BackfillJob>, PartnerError> {
        let mut state = self.lock()?;
        state.take_failure(StoreOp::PendingBackfills)?;
        Ok(state.backfills.iter().filter(|b| b.is_open()).cloned().collect())
    }

    async fn record_backfill_progress(
        &self,
        id: i64,
        cursor: DateTime<Utc>,
        new_matches: i64,
    ) -> Result<BackfillJob, PartnerError> {
        let mut state = self.lock()?;
        state.take_failure(StoreOp::RecordProgress)?;
        let job = state
            .backfills
            .iter_mut()
            .find(|b| b.id == id && b.is_open())
            .ok_or_else(|| PartnerError::not_found("Open backfill", id))?;
        job.last_processed_cursor = Some(match job.last_processed_cursor {
            Some(current) => current.max(cursor),
            None => cursor,
        });
        job.number_of_matches += new_matches;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn complete_backfill(
        &self,
        id: i64,
        error_description: Option<&str>,
    ) -> Result<BackfillJob, PartnerError> {
        let mut state = self.lock()?;
        state.take_failure(StoreOp::CompleteBackfill)?;
        let job = state
            .backfills
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| PartnerError::not_found("Backfill", id))?;
        if job.completed_at.is_none() {
            let now = Utc::now();
            job.completed_at = Some(now);
            job.error_description = error_description.map(str::to_string);
            job.updated_at = now;
        }
        Ok(job.clone())
    }
}
