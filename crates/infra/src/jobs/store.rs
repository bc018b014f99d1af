//! Job storage: the only writer of job status.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use productsnap_core::{DomainError, JobId, OwnerId};
use productsnap_jobs::{CancelOutcome, Job, JobError, JobStatus, Transition};

/// Durable record of jobs and their state-machine transitions.
///
/// Every status write is a compare-and-set: commands issued by a worker carry
/// the attempt number they were started under, and the store rejects them with
/// [`JobStoreError::StaleAttempt`] once the job has moved on to another
/// attempt. Transitions requested on a terminal job leave it unchanged.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a new job (normally in `pending`).
    async fn create(&self, job: Job) -> Result<Job, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// An owner's jobs, newest first.
    async fn list_by_owner(&self, owner_id: OwnerId, limit: usize)
    -> Result<Vec<Job>, JobStoreError>;

    /// pending -> queued.
    async fn mark_queued(&self, job_id: JobId) -> Result<JobUpdate, JobStoreError>;

    /// queued -> processing, counting a new attempt.
    async fn begin_attempt(&self, job_id: JobId) -> Result<JobUpdate, JobStoreError>;

    /// processing -> completed under `attempt`.
    async fn complete(
        &self,
        job_id: JobId,
        attempt: u32,
        result_refs: Vec<String>,
    ) -> Result<JobUpdate, JobStoreError>;

    /// processing -> failed under `attempt`.
    async fn fail(
        &self,
        job_id: JobId,
        attempt: u32,
        error: JobError,
    ) -> Result<JobUpdate, JobStoreError>;

    /// processing -> queued under `attempt` (retry or lease reclaim).
    async fn requeue(&self, job_id: JobId, attempt: u32) -> Result<JobUpdate, JobStoreError>;

    /// Raise progress for `attempt`. Returns whether the stored value moved.
    async fn record_progress(
        &self,
        job_id: JobId,
        attempt: u32,
        percent: u8,
    ) -> Result<bool, JobStoreError>;

    /// Owner cancellation: immediate unless the job is processing.
    async fn request_cancel(&self, job_id: JobId) -> Result<CancelRequest, JobStoreError>;

    /// processing -> cancelled, performed by the worker holding `attempt`.
    async fn finish_cancel(&self, job_id: JobId, attempt: u32) -> Result<JobUpdate, JobStoreError>;

    async fn stats(&self, owner_id: OwnerId) -> Result<JobStats, JobStoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid transition for job {job_id}: {reason}")]
    InvalidTransition { job_id: JobId, reason: DomainError },
    #[error("stale attempt for job {job_id}: expected attempt {expected}, job is on {actual}")]
    StaleAttempt {
        job_id: JobId,
        expected: u32,
        actual: u32,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// A job after a store command, with the effect the command had.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUpdate {
    pub job: Job,
    pub transition: Transition,
}

impl JobUpdate {
    pub fn applied(&self) -> bool {
        self.transition == Transition::Applied
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    pub job: Job,
    pub outcome: CancelOutcome,
}

/// Per-owner job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    /// Jobs that have not reached a terminal state.
    pub fn in_flight(&self) -> usize {
        self.pending + self.queued + self.processing
    }

    pub(crate) fn count(&mut self, status: JobStatus, n: usize) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Queued => self.queued += n,
            JobStatus::Processing => self.processing += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Cancelled => self.cancelled += n,
        }
    }
}

/// A status write, shared by every store implementation.
#[derive(Debug, Clone)]
pub(crate) enum JobCommand {
    MarkQueued,
    BeginAttempt,
    Complete(Vec<String>),
    Fail(JobError),
    Requeue,
    FinishCancel,
}

impl JobCommand {
    /// Attempt-scoped commands only apply to the attempt that issued them.
    fn scoped(&self) -> bool {
        !matches!(self, JobCommand::MarkQueued | JobCommand::BeginAttempt)
    }
}

pub(crate) fn check_attempt(job: &Job, attempt: u32) -> Result<(), JobStoreError> {
    if job.attempt_count != attempt {
        return Err(JobStoreError::StaleAttempt {
            job_id: job.id,
            expected: attempt,
            actual: job.attempt_count,
        });
    }
    Ok(())
}

/// Run `command` against `job` and return the resulting state.
///
/// Works on a copy so a rejected command leaves the caller's record intact.
pub(crate) fn execute(
    job: &Job,
    command: JobCommand,
    attempt: u32,
    now: DateTime<Utc>,
) -> Result<JobUpdate, JobStoreError> {
    if command.scoped() {
        check_attempt(job, attempt)?;
    }

    let mut next = job.clone();
    let outcome = match command {
        JobCommand::MarkQueued => next.mark_queued(now),
        JobCommand::BeginAttempt => next.begin_attempt(now),
        JobCommand::Complete(refs) => next.complete(refs, now),
        JobCommand::Fail(error) => next.fail(error, now),
        JobCommand::Requeue => next.requeue(now),
        JobCommand::FinishCancel => next.cancel(now),
    };
    let transition = outcome.map_err(|reason| JobStoreError::InvalidTransition {
        job_id: job.id,
        reason,
    })?;

    Ok(JobUpdate {
        job: next,
        transition,
    })
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn apply(
        &self,
        job_id: JobId,
        command: JobCommand,
        attempt: u32,
    ) -> Result<JobUpdate, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        let update = execute(job, command, attempt, Utc::now())?;
        if update.applied() {
            *job = update.job.clone();
        }
        Ok(update)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().unwrap().get(&job_id).cloned())
    }

    async fn list_by_owner(
        &self,
        owner_id: OwnerId,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.owner_id == owner_id)
            .cloned()
            .collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn mark_queued(&self, job_id: JobId) -> Result<JobUpdate, JobStoreError> {
        self.apply(job_id, JobCommand::MarkQueued, 0)
    }

    async fn begin_attempt(&self, job_id: JobId) -> Result<JobUpdate, JobStoreError> {
        self.apply(job_id, JobCommand::BeginAttempt, 0)
    }

    async fn complete(
        &self,
        job_id: JobId,
        attempt: u32,
        result_refs: Vec<String>,
    ) -> Result<JobUpdate, JobStoreError> {
        self.apply(job_id, JobCommand::Complete(result_refs), attempt)
    }

    async fn fail(
        &self,
        job_id: JobId,
        attempt: u32,
        error: JobError,
    ) -> Result<JobUpdate, JobStoreError> {
        self.apply(job_id, JobCommand::Fail(error), attempt)
    }

    async fn requeue(&self, job_id: JobId, attempt: u32) -> Result<JobUpdate, JobStoreError> {
        self.apply(job_id, JobCommand::Requeue, attempt)
    }

    async fn record_progress(
        &self,
        job_id: JobId,
        attempt: u32,
        percent: u8,
    ) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        check_attempt(job, attempt)?;
        let moved = job.record_progress(percent);
        if moved {
            job.updated_at = Utc::now();
        }
        Ok(moved)
    }

    async fn request_cancel(&self, job_id: JobId) -> Result<CancelRequest, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        let outcome = job.request_cancel(Utc::now());
        Ok(CancelRequest {
            job: job.clone(),
            outcome,
        })
    }

    async fn finish_cancel(&self, job_id: JobId, attempt: u32) -> Result<JobUpdate, JobStoreError> {
        self.apply(job_id, JobCommand::FinishCancel, attempt)
    }

    async fn stats(&self, owner_id: OwnerId) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut stats = JobStats::default();
        for job in jobs.values().filter(|j| j.owner_id == owner_id) {
            stats.count(job.status, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl<S: JobStore> JobStore for Arc<S> {
    async fn create(&self, job: Job) -> Result<Job, JobStoreError> {
        (**self).create(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn list_by_owner(
        &self,
        owner_id: OwnerId,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_owner(owner_id, limit).await
    }

    async fn mark_queued(&self, job_id: JobId) -> Result<JobUpdate, JobStoreError> {
        (**self).mark_queued(job_id).await
    }

    async fn begin_attempt(&self, job_id: JobId) -> Result<JobUpdate, JobStoreError> {
        (**self).begin_attempt(job_id).await
    }

    async fn complete(
        &self,
        job_id: JobId,
        attempt: u32,
        result_refs: Vec<String>,
    ) -> Result<JobUpdate, JobStoreError> {
        (**self).complete(job_id, attempt, result_refs).await
    }

    async fn fail(
        &self,
        job_id: JobId,
        attempt: u32,
        error: JobError,
    ) -> Result<JobUpdate, JobStoreError> {
        (**self).fail(job_id, attempt, error).await
    }

    async fn requeue(&self, job_id: JobId, attempt: u32) -> Result<JobUpdate, JobStoreError> {
        (**self).requeue(job_id, attempt).await
    }

    async fn record_progress(
        &self,
        job_id: JobId,
        attempt: u32,
        percent: u8,
    ) -> Result<bool, JobStoreError> {
        (**self).record_progress(job_id, attempt, percent).await
    }

    async fn request_cancel(&self, job_id: JobId) -> Result<CancelRequest, JobStoreError> {
        (**self).request_cancel(job_id).await
    }

    async fn finish_cancel(&self, job_id: JobId, attempt: u32) -> Result<JobUpdate, JobStoreError> {
        (**self).finish_cancel(job_id, attempt).await
    }

    async fn stats(&self, owner_id: OwnerId) -> Result<JobStats, JobStoreError> {
        (**self).stats(owner_id).await
    }
}
