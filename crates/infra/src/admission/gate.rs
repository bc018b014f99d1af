use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use productsnap_core::{JobId, OwnerId};
use productsnap_jobs::{
    CancelOutcome, DEFAULT_MAX_ATTEMPTS, GenerationParameters, Job, JobError, JobMode, JobStatus,
    PeriodKind, UsageSnapshot,
};

use super::plans::PlanDirectory;
use crate::clock::{Clock, SystemClock};
use crate::dispatch::{DispatchQueue, Priority};
use crate::jobs::{CancelRequest, JobStore, JobStoreError};
use crate::quota::{QuotaDebit, QuotaError, QuotaLedger};

const MAX_INPUT_REF_LEN: usize = 2048;

/// A caller's request to run one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub owner_id: OwnerId,
    /// Wire name of the transformation (`studio_white`, ...).
    pub mode: String,
    pub input_ref: String,
    /// Free text or JSON sub-option metadata.
    pub prompt: Option<String>,
    pub prompt_override: Option<String>,
}

impl Submission {
    pub fn new(owner_id: OwnerId, mode: impl Into<String>, input_ref: impl Into<String>) -> Self {
        Self {
            owner_id,
            mode: mode.into(),
            input_ref: input_ref.into(),
            prompt: None,
            prompt_override: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_prompt_override(mut self, prompt_override: impl Into<String>) -> Self {
        self.prompt_override = Some(prompt_override.into());
        self
    }
}

/// Structured rejection of a submission.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("quota exceeded: {limit} jobs per {} period", .period_kind.as_str())]
    QuotaExceeded {
        limit: u32,
        period_kind: PeriodKind,
        /// Time until the period rolls over.
        retry_after: Duration,
    },
    #[error("concurrent job limit reached: {limit} unfinished jobs")]
    ConcurrencyLimit { limit: u32 },
    #[error("admission storage error: {0}")]
    Store(String),
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {0} belongs to another owner")]
    Forbidden(JobId),
    #[error("storage error: {0}")]
    Store(String),
}

impl From<JobStoreError> for QueryError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => QueryError::NotFound(id),
            other => QueryError::Store(other.to_string()),
        }
    }
}

impl From<QuotaError> for QueryError {
    fn from(err: QuotaError) -> Self {
        QueryError::Store(err.to_string())
    }
}

/// What a caller polling a job gets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub result_refs: Vec<String>,
    pub error: Option<JobError>,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            result_refs: job.result_refs.clone(),
            error: job.error.clone(),
            attempt_count: job.attempt_count,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

/// Front door of the job core.
///
/// Admission is quota-first: a submission that fails validation never
/// touches the ledger, and a submission the ledger refuses never creates a
/// job. This is also the only component that writes to the ledger; workers
/// hand refunds back through [`AdmissionGate::refund`].
pub struct AdmissionGate {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn QuotaLedger>,
    queue: Arc<dyn DispatchQueue>,
    plans: Arc<dyn PlanDirectory>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl AdmissionGate {
    pub fn new(
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn QuotaLedger>,
        queue: Arc<dyn DispatchQueue>,
        plans: Arc<dyn PlanDirectory>,
    ) -> Self {
        Self {
            store,
            ledger,
            queue,
            plans,
            clock: Arc::new(SystemClock),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Admit a job: validate, check the concurrency cap, debit quota,
    /// create, enqueue.
    ///
    /// The concurrency cap counts the owner's unfinished jobs before the
    /// debit. Unlike the quota debit it is not atomic, so racing submissions
    /// from one owner can briefly exceed it.
    pub async fn submit(&self, submission: Submission) -> Result<Job, SubmitError> {
        let (mode, parameters) = validate(&submission)?;
        let owner_id = submission.owner_id;

        let tier = self.plans.tier_for(owner_id).await;
        let limit = self.plans.limit_for(tier);
        let now = self.clock.now();

        if let Some(cap) = limit.concurrent_jobs {
            let in_flight = self
                .store
                .stats(owner_id)
                .await
                .map_err(|e| SubmitError::Store(e.to_string()))?
                .in_flight();
            if !limit.admits_concurrent(in_flight) {
                info!(owner_id = %owner_id, in_flight, limit = cap, "concurrent job limit reached");
                return Err(SubmitError::ConcurrencyLimit { limit: cap });
            }
        }

        let debit = match self.ledger.try_debit(owner_id, tier, limit, now).await {
            Ok(debit) => debit,
            Err(QuotaError::Exceeded {
                limit,
                period_kind,
                period_end,
            }) => {
                info!(owner_id = %owner_id, limit, period = period_kind.as_str(), "quota exceeded");
                return Err(SubmitError::QuotaExceeded {
                    limit,
                    period_kind,
                    retry_after: (period_end - now).to_std().unwrap_or_default(),
                });
            }
            Err(e) => return Err(SubmitError::Store(e.to_string())),
        };

        let job = Job::new(
            JobId::new(),
            owner_id,
            mode,
            submission.input_ref.trim(),
            parameters,
            tier,
            debit.period(),
            now,
        )
        .with_max_attempts(self.max_attempts);
        let job_id = job.id;

        if let Err(e) = self.store.create(job).await {
            self.credit_back(&debit).await;
            return Err(SubmitError::Store(e.to_string()));
        }

        match self.enqueue(job_id, Priority::for_tier(tier)).await {
            Ok(job) => {
                info!(
                    job_id = %job_id,
                    owner_id = %owner_id,
                    mode = mode.as_str(),
                    usage = debit.usage_count,
                    limit = debit.limit,
                    "job admitted"
                );
                Ok(job)
            }
            Err(e) => {
                // Withdraw the job so no debit is left without a live job.
                if let Err(cancel_err) = self.store.request_cancel(job_id).await {
                    error!(job_id = %job_id, error = %cancel_err, "failed to withdraw unqueued job");
                }
                self.credit_back(&debit).await;
                Err(SubmitError::Store(e))
            }
        }
    }

    async fn enqueue(&self, job_id: JobId, priority: Priority) -> Result<Job, String> {
        let update = self
            .store
            .mark_queued(job_id)
            .await
            .map_err(|e| e.to_string())?;
        self.queue
            .enqueue(job_id, priority)
            .await
            .map_err(|e| e.to_string())?;
        Ok(update.job)
    }

    async fn credit_back(&self, debit: &QuotaDebit) {
        if let Err(e) = self
            .ledger
            .credit(debit.owner_id, debit.period_kind, debit.period_start)
            .await
        {
            error!(owner_id = %debit.owner_id, error = %e, "failed to credit back quota debit");
        }
    }

    /// Latest known state of a job.
    pub async fn status(&self, job_id: JobId) -> Result<JobStatusView, QueryError> {
        let job = self.load(job_id).await?;
        Ok(JobStatusView::from(&job))
    }

    /// Usage of the owner's active period.
    pub async fn usage(&self, owner_id: OwnerId) -> Result<UsageSnapshot, QueryError> {
        let tier = self.plans.tier_for(owner_id).await;
        let limit = self.plans.limit_for(tier);
        Ok(self
            .ledger
            .snapshot(owner_id, tier, limit, self.clock.now())
            .await?)
    }

    /// The owner's most recent jobs.
    pub async fn list_jobs(&self, owner_id: OwnerId, limit: usize) -> Result<Vec<Job>, QueryError> {
        Ok(self.store.list_by_owner(owner_id, limit).await?)
    }

    /// Cancel on behalf of the owner. Idempotent on terminal jobs.
    pub async fn cancel(&self, owner_id: OwnerId, job_id: JobId) -> Result<CancelRequest, QueryError> {
        let job = self.load(job_id).await?;
        if job.owner_id != owner_id {
            return Err(QueryError::Forbidden(job_id));
        }

        let request = self.store.request_cancel(job_id).await?;
        match request.outcome {
            CancelOutcome::Cancelled => {
                match self.queue.remove(job_id).await {
                    Ok(_) => {}
                    Err(e) => warn!(job_id = %job_id, error = %e, "failed to drop cancelled job from queue"),
                }
                if let Err(e) = self.refund(&request.job).await {
                    error!(job_id = %job_id, error = %e, "refund for cancelled job failed");
                }
                info!(job_id = %job_id, owner_id = %owner_id, "job cancelled");
            }
            CancelOutcome::Requested => {
                info!(job_id = %job_id, owner_id = %owner_id, "cancellation requested for running job");
            }
            CancelOutcome::AlreadyTerminal(status) => {
                info!(job_id = %job_id, status = %status, "cancel ignored, job already finished");
            }
        }
        Ok(request)
    }

    /// Credit one unit back to the period the job was charged to.
    pub async fn refund(&self, job: &Job) -> Result<(), QuotaError> {
        self.ledger
            .credit(job.owner_id, job.quota_period_kind, job.quota_period_start)
            .await?;
        info!(job_id = %job.id, owner_id = %job.owner_id, status = %job.status, "quota refunded");
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> Result<Job, QueryError> {
        self.store
            .get(job_id)
            .await?
            .ok_or(QueryError::NotFound(job_id))
    }
}

fn validate(submission: &Submission) -> Result<(JobMode, GenerationParameters), SubmitError> {
    let mode: JobMode = submission
        .mode
        .parse()
        .map_err(|e: productsnap_core::DomainError| SubmitError::Validation(e.to_string()))?;

    let input_ref = submission.input_ref.trim();
    if input_ref.is_empty() {
        return Err(SubmitError::Validation("input_ref is required".to_string()));
    }
    if input_ref.len() > MAX_INPUT_REF_LEN {
        return Err(SubmitError::Validation(format!(
            "input_ref longer than {MAX_INPUT_REF_LEN} bytes"
        )));
    }
    if input_ref.chars().any(char::is_control) {
        return Err(SubmitError::Validation(
            "input_ref contains control characters".to_string(),
        ));
    }

    let mut parameters = match submission.prompt.as_deref().map(str::trim) {
        Some(prompt) if !prompt.is_empty() => GenerationParameters::from_prompt_metadata(prompt),
        _ => GenerationParameters::default(),
    };
    if let Some(extra) = submission
        .prompt_override
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        parameters = parameters.with_prompt_override(extra);
    }

    Ok((mode, parameters))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::InMemoryPlanDirectory;
    use crate::clock::ManualClock;
    use crate::dispatch::InMemoryDispatchQueue;
    use crate::jobs::InMemoryJobStore;
    use crate::quota::InMemoryQuotaLedger;
    use chrono::TimeZone;
    use productsnap_core::WorkerId;
    use productsnap_jobs::{PlanLimit, PlanLimits, PlanTier};

    struct Harness {
        gate: Arc<AdmissionGate>,
        store: Arc<InMemoryJobStore>,
        queue: Arc<InMemoryDispatchQueue>,
        plans: Arc<InMemoryPlanDirectory>,
        clock: ManualClock,
    }

    fn harness(free_limit: u32) -> Harness {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryDispatchQueue::default());
        let plans = Arc::new(InMemoryPlanDirectory::new(PlanLimits {
            free: PlanLimit::daily(free_limit),
            ..PlanLimits::default()
        }));
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 10, 9, 0, 0).unwrap());
        let gate = AdmissionGate::new(
            store.clone(),
            Arc::new(InMemoryQuotaLedger::new()),
            queue.clone(),
            plans.clone(),
        )
        .with_clock(Arc::new(clock.clone()));
        Harness {
            gate: Arc::new(gate),
            store,
            queue,
            plans,
            clock,
        }
    }

    #[tokio::test]
    async fn admitted_job_is_queued() {
        let h = harness(5);
        let owner = OwnerId::new();

        let job = h
            .gate
            .submit(Submission::new(owner, "studio_white", "uploads/bag.png"))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert!(h.queue.contains(job.id));
        assert_eq!(h.gate.usage(owner).await.unwrap().usage_count, 1);
    }

    #[tokio::test]
    async fn invalid_submission_leaves_quota_untouched() {
        let h = harness(5);
        let owner = OwnerId::new();

        let bad_mode = h
            .gate
            .submit(Submission::new(owner, "oil_painting", "uploads/bag.png"))
            .await;
        assert!(matches!(bad_mode, Err(SubmitError::Validation(_))));

        let bad_input = h.gate.submit(Submission::new(owner, "model_tryon", "  ")).await;
        assert!(matches!(bad_input, Err(SubmitError::Validation(_))));

        assert_eq!(h.gate.usage(owner).await.unwrap().usage_count, 0);
        assert!(h.gate.list_jobs(owner, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn quota_exceeded_creates_no_job_and_hints_retry() {
        let h = harness(1);
        let owner = OwnerId::new();
        h.gate
            .submit(Submission::new(owner, "studio_white", "a.png"))
            .await
            .unwrap();

        let err = h
            .gate
            .submit(Submission::new(owner, "studio_white", "b.png"))
            .await
            .unwrap_err();
        match err {
            SubmitError::QuotaExceeded {
                limit,
                period_kind,
                retry_after,
            } => {
                assert_eq!(limit, 1);
                assert_eq!(period_kind, PeriodKind::Daily);
                assert_eq!(retry_after, Duration::from_secs(15 * 3600));
            }
            other => panic!("unexpected: {other}"),
        }
        assert_eq!(h.gate.list_jobs(owner, 10).await.unwrap().len(), 1);

        // Next day the period rolls over.
        h.clock.advance(chrono::Duration::days(1));
        assert!(
            h.gate
                .submit(Submission::new(owner, "studio_white", "c.png"))
                .await
                .is_ok()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submissions_admit_exactly_the_headroom() {
        let h = harness(5);
        let owner = OwnerId::new();
        for i in 0..3 {
            h.gate
                .submit(Submission::new(owner, "studio_white", format!("seed-{i}.png")))
                .await
                .unwrap();
        }

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let gate = h.gate.clone();
                tokio::spawn(async move {
                    gate.submit(Submission::new(owner, "lifestyle_scene", format!("in-{i}.png")))
                        .await
                })
            })
            .collect();

        let mut admitted = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(SubmitError::QuotaExceeded { .. }) => rejected += 1,
                Err(other) => panic!("unexpected: {other}"),
            }
        }

        assert_eq!(admitted, 2);
        assert_eq!(rejected, 8);
        assert_eq!(h.gate.usage(owner).await.unwrap().usage_count, 5);
        assert_eq!(h.store.stats(owner).await.unwrap().queued, 5);
    }

    #[tokio::test]
    async fn concurrency_cap_holds_until_a_job_finishes() {
        let h = harness(5);
        let owner = OwnerId::new();
        h.plans.set_tier(owner, PlanTier::Personal);

        for i in 0..3 {
            h.gate
                .submit(Submission::new(owner, "studio_white", format!("{i}.png")))
                .await
                .unwrap();
        }
        let err = h
            .gate
            .submit(Submission::new(owner, "studio_white", "3.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::ConcurrencyLimit { limit: 3 }));
        // The rejected submission was not charged.
        assert_eq!(h.gate.usage(owner).await.unwrap().usage_count, 3);

        // Other owners are unaffected.
        assert!(
            h.gate
                .submit(Submission::new(OwnerId::new(), "studio_white", "x.png"))
                .await
                .is_ok()
        );

        // Finishing one job frees a slot.
        let lease = h.queue.lease(WorkerId::new()).await.unwrap().unwrap();
        let started = h.store.begin_attempt(lease.job_id).await.unwrap();
        h.store
            .complete(lease.job_id, started.job.attempt_count, vec!["mem://done.png".into()])
            .await
            .unwrap();
        assert!(
            h.gate
                .submit(Submission::new(owner, "studio_white", "4.png"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn free_tier_runs_one_job_at_a_time_by_default() {
        let h = harness(5);
        let plans = Arc::new(InMemoryPlanDirectory::default());
        let gate = AdmissionGate::new(
            h.store.clone(),
            Arc::new(InMemoryQuotaLedger::new()),
            h.queue.clone(),
            plans,
        );
        let owner = OwnerId::new();

        let first = gate
            .submit(Submission::new(owner, "studio_white", "a.png"))
            .await
            .unwrap();
        assert!(matches!(
            gate.submit(Submission::new(owner, "studio_white", "b.png")).await,
            Err(SubmitError::ConcurrencyLimit { limit: 1 })
        ));

        gate.cancel(owner, first.id).await.unwrap();
        assert!(
            gate.submit(Submission::new(owner, "studio_white", "c.png"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn paid_owner_lands_in_paid_lane() {
        let h = harness(5);
        let owner = OwnerId::new();
        h.plans.set_tier(owner, PlanTier::Pro);

        let job = h
            .gate
            .submit(Submission::new(owner, "model_tryon", "a.png"))
            .await
            .unwrap();
        assert_eq!(job.plan_tier, PlanTier::Pro);

        let lease = h.queue.lease(WorkerId::new()).await.unwrap().unwrap();
        assert_eq!(lease.priority, Priority::Paid);
        assert_eq!(h.gate.usage(owner).await.unwrap().limit, 1000);
    }

    #[tokio::test]
    async fn prompt_metadata_becomes_parameters() {
        let h = harness(5);
        let job = h
            .gate
            .submit(
                Submission::new(OwnerId::new(), "lifestyle_scene", "a.png")
                    .with_prompt(r#"{"scene_environment":"garden"}"#)
                    .with_prompt_override("golden hour"),
            )
            .await
            .unwrap();
        assert_eq!(job.parameters.scene_environment.as_deref(), Some("garden"));
        assert_eq!(job.parameters.prompt_override.as_deref(), Some("golden hour"));
    }

    #[tokio::test]
    async fn cancel_queued_job_refunds_and_dequeues() {
        let h = harness(5);
        let owner = OwnerId::new();
        let job = h
            .gate
            .submit(Submission::new(owner, "studio_white", "a.png"))
            .await
            .unwrap();

        let request = h.gate.cancel(owner, job.id).await.unwrap();
        assert_eq!(request.outcome, CancelOutcome::Cancelled);
        assert!(!h.queue.contains(job.id));
        assert_eq!(h.gate.usage(owner).await.unwrap().usage_count, 0);

        // Second cancel is a no-op and does not refund again.
        let again = h.gate.cancel(owner, job.id).await.unwrap();
        assert_eq!(again.outcome, CancelOutcome::AlreadyTerminal(JobStatus::Cancelled));
        assert_eq!(h.gate.usage(owner).await.unwrap().usage_count, 0);
    }

    #[tokio::test]
    async fn refund_after_upgrade_credits_the_monthly_period() {
        let h = harness(5);
        let owner = OwnerId::new();
        h.clock.set(Utc.with_ymd_and_hms(2025, 7, 1, 10, 0, 0).unwrap());
        h.gate
            .submit(Submission::new(owner, "studio_white", "a.png"))
            .await
            .unwrap();

        // Upgraded the next day: the monthly period also starts on July 1.
        h.clock.advance(chrono::Duration::days(1));
        h.plans.set_tier(owner, PlanTier::Pro);
        let job = h
            .gate
            .submit(Submission::new(owner, "studio_white", "b.png"))
            .await
            .unwrap();
        assert_eq!(job.quota_period_kind, PeriodKind::Monthly);
        assert_eq!(job.quota_period_start, Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap());
        assert_eq!(h.gate.usage(owner).await.unwrap().usage_count, 1);

        h.gate.cancel(owner, job.id).await.unwrap();
        let usage = h.gate.usage(owner).await.unwrap();
        assert_eq!(usage.period_kind, PeriodKind::Monthly);
        assert_eq!(usage.usage_count, 0);

        // The monthly period keeps admitting.
        assert!(
            h.gate
                .submit(Submission::new(owner, "studio_white", "c.png"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn cancel_by_other_owner_is_forbidden() {
        let h = harness(5);
        let job = h
            .gate
            .submit(Submission::new(OwnerId::new(), "studio_white", "a.png"))
            .await
            .unwrap();
        assert!(matches!(
            h.gate.cancel(OwnerId::new(), job.id).await,
            Err(QueryError::Forbidden(_))
        ));
        assert!(matches!(
            h.gate.status(JobId::new()).await,
            Err(QueryError::NotFound(_))
        ));
    }
}
