/// Backfill scheduling: explicit starts and the pending-backfill sweep.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinSet;

use super::queue::{BackfillQueue, BackfillTicket};
use super::runner::BackfillRunner;
use super::{BackfillJob, BackfillType, NewBackfillJob};
use crate::errors::PartnerError;
use crate::store::PartnerStore;

/// Request to start a backfill for one partner.
#[derive(Debug, Clone, PartialEq)]
pub struct StartBackfillRequest {
    pub partner_channel_item_id: i64,
    pub backfill_type: Option<BackfillType>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// Counts from one pending-backfill sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub launched: usize,
    pub finished: usize,
    /// Open jobs of a type without a runner
    pub skipped: usize,
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

pub struct BackfillScheduler {
    store: Arc<dyn PartnerStore>,
    runner: Arc<BackfillRunner>,
    queue: BackfillQueue,
}

impl BackfillScheduler {
    pub fn new(store: Arc<dyn PartnerStore>, runner: Arc<BackfillRunner>, queue_capacity: usize) -> Self {
        let queue = BackfillQueue::new(Arc::clone(&runner), queue_capacity);
        BackfillScheduler { store, runner, queue }
    }

    /// Validate and record a new backfill, then hand it to a background runner.
    ///
    /// Returns once the job row exists. Runner-phase errors are never returned
    /// here; they end up in the job's error_description.
    pub async fn start_backfill(&self, request: StartBackfillRequest) -> Result<BackfillJob, PartnerError> {
        let backfill_type = request
            .backfill_type
            .ok_or_else(|| PartnerError::invalid("backfill_type", "backfill type is required"))?;
        let (start_date, end_date) = match (request.start_date, request.end_date) {
            (Some(start), Some(end)) => (start_of_day(start), start_of_day(end)),
            _ => {
                return Err(PartnerError::invalid(
                    "start_date",
                    "start date and end date are required",
                ))
            }
        };
        if start_date > end_date {
            return Err(PartnerError::InvalidInput {
                message: format!("start date {} is after end date {}", start_date, end_date),
                field: Some("end_date".to_string()),
            });
        }
        if !backfill_type.is_runnable() {
            return Err(PartnerError::invalid(
                "backfill_type",
                &format!("backfill type {} is not supported", backfill_type),
            ));
        }

        let partner = self
            .store
            .get_partner_by_channel_item_id(request.partner_channel_item_id)
            .await
            .map_err(|e| match e {
                PartnerError::NotFound { .. } => PartnerError::not_found(
                    "Partner with station channel item id",
                    request.partner_channel_item_id,
                ),
                other => PartnerError::Internal(format!("GetPartnerByStationChannelItemID error: {}", other)),
            })?;

        let open = self
            .store
            .get_open_backfill(partner.id, backfill_type)
            .await
            .map_err(|e| PartnerError::Internal(format!("GetInProgressBackfillByPartnerAndType error: {}", e)))?;
        if open.is_some() {
            return Err(PartnerError::Conflict(format!(
                "backfill is already in progress for partner {} and type {}",
                request.partner_channel_item_id, backfill_type
            )));
        }

        let job = self
            .store
            .add_backfill(NewBackfillJob {
                partner_id: partner.id,
                backfill_type,
                start_date,
                end_date,
            })
            .await
            .map_err(|e| match e {
                conflict @ PartnerError::Conflict(_) => conflict,
                other => PartnerError::Internal(format!("AddPartnerAssociationBackfill error: {}", other)),
            })?;

        tracing::info!(
            backfill_id = job.id,
            partner_id = partner.id,
            backfill_type = %backfill_type,
            start_date = %job.start_date,
            end_date = %job.end_date,
            "Backfill created"
        );

        self.queue.enqueue(BackfillTicket {
            partner,
            job: job.clone(),
        });
        Ok(job)
    }

    /// Run every open backfill concurrently and wait for them.
    ///
    /// Returns the first runner error as soon as it is seen. Runners still in
    /// flight at that point are detached and keep going.
    pub async fn process_pending_backfills(&self) -> Result<SweepSummary, PartnerError> {
        let pending = self.store.get_pending_backfills().await.map_err(|e| {
            tracing::error!(error = %e, "GetPendingBackfills error");
            PartnerError::Internal(format!("GetPendingBackfills error: {}", e))
        })?;

        let mut summary = SweepSummary::default();
        if pending.is_empty() {
            return Ok(summary);
        }

        let mut tasks = JoinSet::new();
        for job in pending {
            if !job.backfill_type.is_runnable() {
                tracing::debug!(
                    backfill_id = job.id,
                    backfill_type = %job.backfill_type,
                    "No runner for backfill type, leaving job pending"
                );
                summary.skipped += 1;
                continue;
            }

            let partner = match self.store.get_partner_by_id(job.partner_id).await {
                Ok(partner) => partner,
                Err(e) => {
                    tracing::error!(
                        backfill_id = job.id,
                        partner_id = job.partner_id,
                        error = %e,
                        "GetPartnerByID error"
                    );
                    tasks.detach_all();
                    return Err(PartnerError::Internal(format!("GetPartnerByID error: {}", e)));
                }
            };

            tracing::info!(
                backfill_id = job.id,
                partner_id = job.partner_id,
                backfill_type = %job.backfill_type,
                "Pending backfill started"
            );
            let runner = Arc::clone(&self.runner);
            tasks.spawn(async move { runner.run(&partner, job).await });
            summary.launched += 1;
        }

        while let Some(result) = tasks.join_next().await {
            let outcome = result
                .map_err(|e| PartnerError::Internal(format!("backfill runner task failed: {}", e)))
                .and_then(|run| run);
            if let Err(e) = outcome {
                tracing::error!(error = %e, "ProcessPendingBackfills error");
                tasks.detach_all();
                return Err(e);
            }
            summary.finished += 1;
        }

        Ok(summary)
    }

    /// Wait for explicitly started backfills to finish.
    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    pub fn queued(&self) -> usize {
        self.queue.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dates_are_midnight_utc() {
        let date = NaiveDate::from_ymd_opt(2023, 3, 14).unwrap();
        assert_eq!(start_of_day(date).to_rfc3339(), "2023-03-14T00:00:00+00:00");
    }
}
