/// Partner service facade
///
/// Wires the store, the remote clients, the origin matchers, the reconciler and
/// the backfill scheduler together and exposes the three service operations.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use crate::backfill::runner::BackfillRunner;
use crate::backfill::scheduler::{BackfillScheduler, StartBackfillRequest, SweepSummary};
use crate::backfill::BackfillJob;
use crate::cache::CachedPatientSearch;
use crate::care_request::CareRequest;
use crate::clients::episode::EpisodeClient;
use crate::clients::pophealth::PopHealthClient;
use crate::clients::{BackfillStatusReporter, CareRequestSource, PatientSearch};
use crate::config::Config;
use crate::errors::PartnerError;
use crate::matching::Matchers;
use crate::reconcile::{AssociationReconciler, ReconcileOutcome};
use crate::store::postgres::PostgresPartnerStore;
use crate::store::{Origin, PartnerStore};

/// Remote collaborators of the service.
pub struct Collaborators {
    pub care_requests: Arc<dyn CareRequestSource>,
    pub patient_search: Arc<dyn PatientSearch>,
    pub reporter: Arc<dyn BackfillStatusReporter>,
}

pub struct PartnerService {
    store: Arc<dyn PartnerStore>,
    matchers: Matchers,
    reconciler: Arc<AssociationReconciler>,
    scheduler: BackfillScheduler,
}

impl PartnerService {
    /// Build the service over an existing store and collaborators.
    ///
    /// Must be called inside a tokio runtime: the backfill queue spawns its worker here.
    pub fn new(store: Arc<dyn PartnerStore>, collaborators: Collaborators, config: &Config) -> Self {
        let cache_capacity = NonZeroUsize::new(config.services.patient_cache_capacity);
        let patient_search: Arc<dyn PatientSearch> = match cache_capacity {
            Some(capacity) if config.services.patient_cache_ttl_secs > 0 => Arc::new(CachedPatientSearch::new(
                collaborators.patient_search,
                Duration::from_secs(config.services.patient_cache_ttl_secs),
                capacity,
            )),
            _ => collaborators.patient_search,
        };

        let matchers = Matchers::new(Arc::clone(&store), patient_search);
        let reconciler = Arc::new(AssociationReconciler::new(Arc::clone(&store)));
        let runner = Arc::new(BackfillRunner::new(
            Arc::clone(&store),
            collaborators.care_requests,
            matchers.pop_health(),
            Arc::clone(&reconciler),
            collaborators.reporter,
            &config.backfill,
        ));
        let scheduler = BackfillScheduler::new(Arc::clone(&store), runner, config.backfill.queue_capacity);

        PartnerService {
            store,
            matchers,
            reconciler,
            scheduler,
        }
    }

    /// Connect to PostgreSQL and the remote services named in `config`.
    pub async fn connect(config: &Config, run_migrations: bool) -> Result<Self, PartnerError> {
        let store = PostgresPartnerStore::new(&config.database_url, run_migrations).await?;
        let timeout = Duration::from_secs(config.services.request_timeout_secs);
        let episode = EpisodeClient::new(&config.services.episode_base_url, timeout)?;
        let pophealth = Arc::new(PopHealthClient::new(&config.services.pophealth_base_url, timeout)?);

        let collaborators = Collaborators {
            care_requests: Arc::new(episode),
            patient_search: pophealth.clone(),
            reporter: pophealth,
        };
        Ok(Self::new(Arc::new(store), collaborators, config))
    }

    pub fn store(&self) -> &Arc<dyn PartnerStore> {
        &self.store
    }

    pub async fn start_backfill(&self, request: StartBackfillRequest) -> Result<BackfillJob, PartnerError> {
        self.scheduler.start_backfill(request).await
    }

    pub async fn get_backfill(&self, id: i64) -> Result<BackfillJob, PartnerError> {
        self.store.get_backfill(id).await
    }

    pub async fn process_pending_backfills(&self) -> Result<SweepSummary, PartnerError> {
        self.scheduler.process_pending_backfills().await
    }

    /// Recompute one origin's partners for a care request and persist the result.
    pub async fn update_care_request_partners(
        &self,
        care_request: &CareRequest,
        origin: Origin,
    ) -> Result<ReconcileOutcome, PartnerError> {
        if care_request.id <= 0 {
            return Err(PartnerError::invalid("care_request.id", "care request id is required"));
        }

        let desired = self.matchers.for_origin(origin).desired_partners(care_request).await?;
        let outcome = self
            .reconciler
            .reconcile_current(care_request.id, origin, &desired)
            .await?;

        tracing::info!(
            care_request_id = care_request.id,
            origin = %origin,
            partners = outcome.associations.len(),
            created = outcome.created,
            deleted = outcome.deleted,
            "Care request partners updated"
        );
        Ok(outcome)
    }

    /// Wait for explicitly started backfills to finish.
    pub async fn flush_backfills(&self) {
        self.scheduler.flush().await;
    }

    pub fn queued_backfills(&self) -> usize {
        self.scheduler.queued()
    }
}
