/// Background queue for explicitly started backfills.
///
/// The job row written before enqueueing is the durable record; the channel
/// only carries work to the runner. A ticket that never runs (queue full,
/// process exit) leaves an open job that the next pending-backfill sweep picks up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::runner::BackfillRunner;
use super::BackfillJob;
use crate::store::Partner;

/// One job handed to a background runner.
#[derive(Debug, Clone)]
pub struct BackfillTicket {
    pub partner: Partner,
    pub job: BackfillJob,
}

/// Releases one pending slot when the runner task ends, including by panic.
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct BackfillQueue {
    sender: mpsc::Sender<BackfillTicket>,
    /// Tickets enqueued but whose runner has not finished
    pending_count: Arc<AtomicUsize>,
}

impl BackfillQueue {
    /// Create the queue and spawn its dispatch worker.
    ///
    /// Each received ticket gets its own runner task, so a long backfill never
    /// delays the start of another.
    pub fn new(runner: Arc<BackfillRunner>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<BackfillTicket>(capacity.max(1));
        let pending_count = Arc::new(AtomicUsize::new(0));
        let worker_pending = Arc::clone(&pending_count);

        tokio::spawn(async move {
            while let Some(ticket) = rx.recv().await {
                let runner = Arc::clone(&runner);
                let pending = PendingGuard(Arc::clone(&worker_pending));
                tokio::spawn(async move {
                    let _pending = pending;
                    let job_id = ticket.job.id;
                    match runner.run(&ticket.partner, ticket.job).await {
                        Ok(job) => tracing::debug!(backfill_id = job.id, "Queued backfill finished"),
                        Err(e) => tracing::error!(
                            backfill_id = job_id,
                            partner_id = ticket.partner.id,
                            error = %e,
                            "Queued backfill failed"
                        ),
                    }
                });
            }
        });

        BackfillQueue {
            sender: tx,
            pending_count,
        }
    }

    /// Enqueue without waiting. Returns false when the queue is full or closed;
    /// the job then stays open for the next sweep.
    pub fn enqueue(&self, ticket: BackfillTicket) -> bool {
        let job_id = ticket.job.id;
        self.pending_count.fetch_add(1, Ordering::Relaxed);
        if self.sender.try_send(ticket).is_err() {
            self.pending_count.fetch_sub(1, Ordering::Relaxed);
            tracing::warn!(
                backfill_id = job_id,
                "Backfill queue full, job deferred to the pending-backfill sweep"
            );
            return false;
        }
        true
    }

    pub fn pending(&self) -> usize {
        self.pending_count.load(Ordering::Relaxed)
    }

    /// Wait until every enqueued backfill has finished. Polls every 100ms.
    pub async fn flush(&self) {
        loop {
            let pending = self.pending_count.load(Ordering::Relaxed);
            if pending == 0 {
                break;
            }
            tracing::debug!(pending, "Waiting for backfill queue to drain");
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}
