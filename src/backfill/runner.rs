/// Backfill runner: drives one job through its window in cursor-ordered batches.
///
/// Each batch fetches `batch_size + 1` care requests created at or after the
/// job cursor. The extra item is not processed; its creation time becomes the
/// next cursor. Progress (cursor and match total) is persisted after every
/// batch, so a runner stopped mid-window resumes from the last persisted batch.
///
/// Any hard failure marks the job FAILED with the error text. Completion always
/// persists the terminal state first and then notifies the population health
/// service; a notification failure is logged only.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{BackfillJob, BackfillState, BackfillStatus};
use crate::clients::{BackfillStatusReport, BackfillStatusReporter, CareRequestSource, CareRequestWindow};
use crate::config::{BackfillConfig, MAX_BATCH_SIZE};
use crate::errors::PartnerError;
use crate::matching::{PopHealthMatcher, PopHealthScope};
use crate::reconcile::AssociationReconciler;
use crate::store::{Origin, Partner, PartnerStore};

/// Job ids with a runner active in this process.
///
/// A second runner for the same job is refused while the first holds its claim.
#[derive(Clone, Default)]
pub struct RunningJobs {
    ids: Arc<Mutex<HashSet<i64>>>,
}

impl RunningJobs {
    pub fn try_claim(&self, job_id: i64) -> Option<JobClaim> {
        let mut ids = self.ids.lock().ok()?;
        ids.insert(job_id).then(|| JobClaim {
            ids: Arc::clone(&self.ids),
            job_id,
        })
    }

    pub fn is_running(&self, job_id: i64) -> bool {
        self.ids.lock().map(|ids| ids.contains(&job_id)).unwrap_or(false)
    }
}

/// Released on drop, including when the runner future is cancelled.
pub struct JobClaim {
    ids: Arc<Mutex<HashSet<i64>>>,
    job_id: i64,
}

impl Drop for JobClaim {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.remove(&self.job_id);
        }
    }
}

enum BatchOutcome {
    /// Window exhausted; the job should complete as PROCESSED
    Exhausted(BackfillJob),
    /// Progress persisted; another batch follows
    Continue(BackfillJob),
}

pub struct BackfillRunner {
    store: Arc<dyn PartnerStore>,
    care_requests: Arc<dyn CareRequestSource>,
    matcher: Arc<PopHealthMatcher>,
    reconciler: Arc<AssociationReconciler>,
    reporter: Arc<dyn BackfillStatusReporter>,
    batch_size: u32,
    sleep_between_batches: Duration,
    running: RunningJobs,
}

impl BackfillRunner {
    pub fn new(
        store: Arc<dyn PartnerStore>,
        care_requests: Arc<dyn CareRequestSource>,
        matcher: Arc<PopHealthMatcher>,
        reconciler: Arc<AssociationReconciler>,
        reporter: Arc<dyn BackfillStatusReporter>,
        config: &BackfillConfig,
    ) -> Self {
        BackfillRunner {
            store,
            care_requests,
            matcher,
            reconciler,
            reporter,
            batch_size: config.batch_size.clamp(1, MAX_BATCH_SIZE),
            sleep_between_batches: config.sleep_between_batches(),
            running: RunningJobs::default(),
        }
    }

    pub fn running_jobs(&self) -> &RunningJobs {
        &self.running
    }

    /// Run `job` for `partner` until it reaches a terminal state.
    ///
    /// Returns the terminal job, or the error that failed it. A job already
    /// being run in this process, or already complete, is returned as stored.
    pub async fn run(&self, partner: &Partner, job: BackfillJob) -> Result<BackfillJob, PartnerError> {
        let Some(_claim) = self.running.try_claim(job.id) else {
            tracing::info!(
                backfill_id = job.id,
                partner_id = partner.id,
                "Backfill already running in this process, skipping"
            );
            return Ok(job);
        };

        // reload under the claim: the cursor may have moved since the caller read it
        let mut job = self
            .store
            .get_backfill(job.id)
            .await
            .map_err(|e| PartnerError::Internal(format!("GetBackfill error: {}", e)))?;
        if !job.is_open() {
            return Ok(job);
        }

        tracing::info!(
            backfill_id = job.id,
            partner_id = partner.id,
            backfill_type = %job.backfill_type,
            resume_from = %job.resume_from(),
            end_date = %job.end_date,
            "Backfill started"
        );

        loop {
            match self.run_batch(partner, &job).await {
                Ok(BatchOutcome::Exhausted(done)) => {
                    return Ok(self.complete(partner, done, None).await);
                }
                Ok(BatchOutcome::Continue(updated)) => {
                    job = updated;
                    if !self.sleep_between_batches.is_zero() {
                        tokio::time::sleep(self.sleep_between_batches).await;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        backfill_id = job.id,
                        partner_id = partner.id,
                        error = %e,
                        "Backfill batch failed"
                    );
                    let description = e.to_string();
                    self.complete(partner, job, Some(&description)).await;
                    return Err(e);
                }
            }
        }
    }

    async fn run_batch(&self, partner: &Partner, job: &BackfillJob) -> Result<BatchOutcome, PartnerError> {
        let batch_size = self.batch_size as usize;
        let resume_from = job.resume_from();
        let window = CareRequestWindow {
            created_from: resume_from,
            created_before: job.end_date,
            max_results: self.batch_size.saturating_add(1),
            include_patient: true,
        };

        let fetched = self
            .care_requests
            .list_care_requests(&window)
            .await
            .map_err(|e| PartnerError::Internal(format!("ListCareRequests error: {}", e)))?;

        let Some(last) = fetched.last() else {
            return Ok(BatchOutcome::Exhausted(job.clone()));
        };
        let batch = &fetched[..fetched.len().min(batch_size)];
        let next = fetched.get(batch_size).unwrap_or(last);
        let next_cursor = next.created_at.ok_or_else(|| {
            PartnerError::Internal(format!(
                "care request {} has no created_at and cannot be used as a cursor",
                next.id
            ))
        })?;

        let scope = PopHealthScope::Backfill {
            channel_item_id: partner.channel_item_id,
        };
        let mut batch_matches: i64 = 0;
        for care_request in batch {
            if let Err(reason) = care_request.validate_for_backfill() {
                tracing::debug!(
                    backfill_id = job.id,
                    care_request_id = care_request.id,
                    reason,
                    "Skipping care request without required attributes"
                );
                continue;
            }

            let desired = self.matcher.desired_partners_scoped(care_request, scope).await?;
            let existing = self
                .store
                .list_active_associations(care_request.id)
                .await
                .map_err(|e| PartnerError::Internal(format!("GetCareRequestPartnersByStationCareRequestID error: {}", e)))?;
            let outcome = self
                .reconciler
                .reconcile(care_request.id, Origin::PopHealth, &existing, &desired)
                .await?;
            batch_matches += outcome.match_count() as i64;
        }

        let updated = self
            .store
            .record_backfill_progress(job.id, next_cursor, batch_matches)
            .await
            .map_err(|e| PartnerError::Internal(format!("UpdatePartnerAssociationBackfillByID error: {}", e)))?;

        tracing::info!(
            backfill_id = job.id,
            partner_id = partner.id,
            processed = batch.len(),
            batch_matches,
            total_matches = updated.number_of_matches,
            cursor = %next_cursor,
            "Backfill batch persisted"
        );

        let exhausted = batch.len() < batch_size
            || batch.last().map(|c| c.id) == Some(next.id)
            || next_cursor <= resume_from;
        if exhausted {
            Ok(BatchOutcome::Exhausted(updated))
        } else {
            Ok(BatchOutcome::Continue(updated))
        }
    }

    /// Persist the terminal state, then notify. Never fails; problems are logged.
    async fn complete(&self, partner: &Partner, job: BackfillJob, error: Option<&str>) -> BackfillJob {
        let requested = if error.is_some() {
            BackfillStatus::Failed
        } else {
            BackfillStatus::Processed
        };

        let job = match self.store.complete_backfill(job.id, error).await {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(
                    backfill_id = job.id,
                    error = %e,
                    "Failed to persist backfill completion"
                );
                job
            }
        };
        // an earlier completion wins over the one requested here
        let status = match job.state() {
            BackfillState::Completed(status) => status,
            _ => requested,
        };

        let report = BackfillStatusReport {
            channel_item_id: partner.channel_item_id,
            number_of_matches: job.number_of_matches,
            status,
        };
        if let Err(e) = self.reporter.report(&report).await {
            tracing::error!(
                backfill_id = job.id,
                channel_item_id = partner.channel_item_id,
                number_of_matches = job.number_of_matches,
                status = %status,
                error = %e,
                "Failed to report backfill status"
            );
        }

        tracing::info!(
            backfill_id = job.id,
            partner_id = partner.id,
            status = %status,
            number_of_matches = job.number_of_matches,
            "Backfill completed"
        );
        job
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let running = RunningJobs::default();
        let claim = running.try_claim(7).expect("first claim");
        assert!(running.try_claim(7).is_none());
        assert!(running.is_running(7));
        assert!(running.try_claim(8).is_some());

        drop(claim);
        assert!(!running.is_running(7));
        assert!(running.try_claim(7).is_some());
    }
}
