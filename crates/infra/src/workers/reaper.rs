//! Lease reaper: returns jobs whose worker went quiet to the queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use productsnap_jobs::{Job, JobError, JobStatus};

use crate::admission::AdmissionGate;
use crate::dispatch::{DispatchQueue, ExpiredLease, QueueError};
use crate::jobs::JobStore;

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapSummary {
    /// Processing jobs sent back for another attempt.
    pub requeued: usize,
    /// Processing jobs whose last attempt ran out.
    pub failed: usize,
    /// Queued jobs whose stale lease was cleared.
    pub reclaimed: usize,
    /// Leases on jobs that had already finished.
    pub dropped: usize,
}

impl ReapSummary {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Sweeps expired leases.
///
/// For a job still `processing` under the expired lease the reaper performs
/// processing -> queued on the store first, under the attempt the job is on,
/// and only then makes the entry leasable again. The store write is the
/// arbiter: if the original holder got its verdict in first, the CAS fails
/// and the lease is simply dropped on a later sweep.
pub struct LeaseReaper {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn DispatchQueue>,
    gate: Arc<AdmissionGate>,
}

impl LeaseReaper {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn DispatchQueue>,
        gate: Arc<AdmissionGate>,
    ) -> Self {
        Self { store, queue, gate }
    }

    pub async fn sweep(&self) -> Result<ReapSummary, QueueError> {
        let mut summary = ReapSummary::default();
        for expired in self.queue.expired_leases().await? {
            let job = match self.store.get(expired.job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    self.drop_lease(&expired).await;
                    summary.dropped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(job_id = %expired.job_id, error = %e, "could not load job for expired lease");
                    continue;
                }
            };

            match job.status {
                JobStatus::Processing => self.reap_processing(job, &expired, &mut summary).await,
                JobStatus::Pending | JobStatus::Queued => {
                    if self.reclaim(&expired).await {
                        summary.reclaimed += 1;
                    }
                }
                _ => {
                    self.drop_lease(&expired).await;
                    summary.dropped += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn reap_processing(&self, job: Job, expired: &ExpiredLease, summary: &mut ReapSummary) {
        let attempt = job.attempt_count;
        let update = if job.cancel_requested {
            self.store.finish_cancel(job.id, attempt).await
        } else if job.has_attempts_left() {
            self.store.requeue(job.id, attempt).await
        } else {
            let error = JobError::timeout(format!(
                "lease expired during final attempt {attempt} of {}",
                job.max_attempts
            ));
            self.store.fail(job.id, attempt, error).await
        };

        let update = match update {
            Ok(update) => update,
            Err(e) => {
                debug!(job_id = %job.id, attempt, error = %e, "job moved on before reaping");
                return;
            }
        };

        if !update.applied() {
            self.drop_lease(expired).await;
            summary.dropped += 1;
            return;
        }

        match update.job.status {
            JobStatus::Queued => {
                if self.reclaim(expired).await {
                    summary.requeued += 1;
                    warn!(
                        job_id = %job.id,
                        worker = %expired.worker_id,
                        attempt,
                        "lease expired, job requeued"
                    );
                }
            }
            status => {
                warn!(job_id = %job.id, worker = %expired.worker_id, attempt, status = %status, "lease expired, job closed");
                if let Err(e) = self.gate.refund(&update.job).await {
                    error!(job_id = %job.id, error = %e, "quota refund failed");
                }
                self.drop_lease(expired).await;
                summary.failed += usize::from(status == JobStatus::Failed);
                summary.dropped += usize::from(status != JobStatus::Failed);
            }
        }
    }

    async fn reclaim(&self, expired: &ExpiredLease) -> bool {
        match self.queue.reclaim(expired.job_id, expired.token).await {
            Ok(reclaimed) => reclaimed,
            Err(e) => {
                warn!(job_id = %expired.job_id, error = %e, "failed to reclaim lease");
                false
            }
        }
    }

    async fn drop_lease(&self, expired: &ExpiredLease) {
        if let Err(e) = self.queue.ack(expired.job_id, expired.token).await {
            debug!(job_id = %expired.job_id, error = %e, "expired lease already gone");
        }
    }

    /// Sweep every `interval` until shutdown.
    pub async fn run(&self, pool: String, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            match self.sweep().await {
                Ok(summary) if !summary.is_empty() => {
                    info!(
                        pool = %pool,
                        requeued = summary.requeued,
                        failed = summary.failed,
                        reclaimed = summary.reclaimed,
                        dropped = summary.dropped,
                        "expired leases reaped"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(pool = %pool, error = %e, "lease sweep failed"),
            }
        }
    }
}
