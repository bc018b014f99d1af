//! The job entity and its state transitions.
//!
//! Mutators enforce the state machine in [`JobStatus::can_transition_to`]
//! and the data invariants (results present iff completed, error present
//! iff failed, attempts bounded). A job that reached a terminal state is
//! immutable: further transitions return [`Transition::Unchanged`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use productsnap_core::{DomainError, DomainResult, JobId, OwnerId};

use crate::error::JobError;
use crate::mode::JobMode;
use crate::params::GenerationParameters;
use crate::quota::{PeriodKind, PlanTier, QuotaPeriod};
use crate::status::JobStatus;

/// Execution attempts allowed per job unless configured otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Effect of a transition request on a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The job moved to the requested state.
    Applied,
    /// The job was already terminal; nothing changed.
    Unchanged,
}

/// Effect of an owner's cancellation request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was not running and is now `cancelled`.
    Cancelled,
    /// The job is running; the worker stops at its next checkpoint.
    Requested,
    /// The job had already finished; its status is returned unchanged.
    AlreadyTerminal(JobStatus),
}

/// An image generation job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: OwnerId,
    pub mode: JobMode,
    pub status: JobStatus,
    /// Opaque reference to the uploaded source image.
    pub input_ref: String,
    pub parameters: GenerationParameters,
    /// Tier the owner was on at admission; decides the dispatch lane.
    pub plan_tier: PlanTier,
    /// Kind and start of the quota period that was debited for this job.
    /// Together with the owner they identify the record a refund credits.
    pub quota_period_kind: PeriodKind,
    pub quota_period_start: DateTime<Utc>,
    pub result_refs: Vec<String>,
    /// Percent complete, never decreasing.
    pub progress: u8,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub cancel_requested: bool,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a job in `pending`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: JobId,
        owner_id: OwnerId,
        mode: JobMode,
        input_ref: impl Into<String>,
        parameters: GenerationParameters,
        plan_tier: PlanTier,
        quota_period: QuotaPeriod,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            owner_id,
            mode,
            status: JobStatus::Pending,
            input_ref: input_ref.into(),
            parameters,
            plan_tier,
            quota_period_kind: quota_period.kind,
            quota_period_start: quota_period.start,
            result_refs: Vec::new(),
            progress: 0,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            cancel_requested: false,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> DomainResult<Transition> {
        if self.status.is_terminal() {
            return Ok(Transition::Unchanged);
        }
        self.status.check_transition(next)?;
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(Transition::Applied)
    }

    /// pending -> queued, once the job is in the dispatch queue.
    pub fn mark_queued(&mut self, now: DateTime<Utc>) -> DomainResult<Transition> {
        if self.status == JobStatus::Processing {
            return Err(DomainError::invalid_transition(self.status, JobStatus::Queued));
        }
        self.transition(JobStatus::Queued, now)
    }

    /// queued -> processing; counts a new attempt.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> DomainResult<Transition> {
        if !self.status.is_terminal() && !self.has_attempts_left() {
            return Err(DomainError::invariant(format!(
                "attempt budget exhausted ({} of {})",
                self.attempt_count, self.max_attempts
            )));
        }
        let outcome = self.transition(JobStatus::Processing, now)?;
        if outcome == Transition::Applied {
            self.attempt_count += 1;
            self.started_at.get_or_insert(now);
        }
        Ok(outcome)
    }

    /// processing -> queued, releasing the job for another attempt.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> DomainResult<Transition> {
        if self.status == JobStatus::Pending {
            return Err(DomainError::invalid_transition(self.status, JobStatus::Queued));
        }
        self.transition(JobStatus::Queued, now)
    }

    /// processing -> completed with durable result references.
    pub fn complete(
        &mut self,
        result_refs: Vec<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition> {
        if self.status.is_terminal() {
            return Ok(Transition::Unchanged);
        }
        if result_refs.is_empty() {
            return Err(DomainError::invariant("completed job needs at least one result"));
        }
        let outcome = self.transition(JobStatus::Completed, now)?;
        self.result_refs = result_refs;
        self.progress = 100;
        self.cancel_requested = false;
        Ok(outcome)
    }

    /// processing -> failed with a classified reason.
    pub fn fail(&mut self, error: JobError, now: DateTime<Utc>) -> DomainResult<Transition> {
        let outcome = self.transition(JobStatus::Failed, now)?;
        if outcome == Transition::Applied {
            self.error = Some(error);
            self.cancel_requested = false;
        }
        Ok(outcome)
    }

    /// Any live state -> cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> DomainResult<Transition> {
        let outcome = self.transition(JobStatus::Cancelled, now)?;
        if outcome == Transition::Applied {
            self.cancel_requested = false;
        }
        Ok(outcome)
    }

    /// Record an owner's cancellation request.
    ///
    /// Jobs that are not running are cancelled on the spot; running jobs are
    /// flagged and cancelled by their worker at the next checkpoint.
    pub fn request_cancel(&mut self, now: DateTime<Utc>) -> CancelOutcome {
        match self.status {
            status if status.is_terminal() => CancelOutcome::AlreadyTerminal(status),
            JobStatus::Processing => {
                self.cancel_requested = true;
                self.updated_at = now;
                CancelOutcome::Requested
            }
            _ => {
                self.status = JobStatus::Cancelled;
                self.completed_at = Some(now);
                self.updated_at = now;
                CancelOutcome::Cancelled
            }
        }
    }

    /// Raise progress; lower or equal values are ignored. Returns whether it moved.
    pub fn record_progress(&mut self, percent: u8) -> bool {
        let percent = percent.min(100);
        if self.status != JobStatus::Processing || percent <= self.progress {
            return false;
        }
        self.progress = percent;
        true
    }

    /// Wall time between the first attempt and the terminal transition.
    pub fn processing_time(&self) -> Option<Duration> {
        Some(self.completed_at? - self.started_at?)
    }

    /// Verify the data invariants that must hold at every commit point.
    pub fn check_invariants(&self) -> DomainResult<()> {
        let completed = self.status == JobStatus::Completed;
        if completed == self.result_refs.is_empty() {
            return Err(DomainError::invariant(format!(
                "result_refs must be non-empty iff completed (status {}, {} refs)",
                self.status,
                self.result_refs.len()
            )));
        }
        if (self.status == JobStatus::Failed) != self.error.is_some() {
            return Err(DomainError::invariant("error must be set iff failed"));
        }
        if self.attempt_count > self.max_attempts {
            return Err(DomainError::invariant("attempt_count exceeds max_attempts"));
        }
        if self.status.is_terminal() != self.completed_at.is_some() {
            return Err(DomainError::invariant("completed_at must be set iff terminal"));
        }
        if self.progress > 100 {
            return Err(DomainError::invariant("progress above 100"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Attribution;
    use proptest::prelude::*;

    fn test_job() -> Job {
        let now = Utc::now();
        Job::new(
            JobId::new(),
            OwnerId::new(),
            JobMode::StudioWhite,
            "s3://uploads/shoe.png",
            GenerationParameters::default(),
            PlanTier::Free,
            QuotaPeriod::containing(PeriodKind::Daily, now),
            now,
        )
    }

    fn processing_job() -> Job {
        let mut job = test_job();
        job.mark_queued(Utc::now()).unwrap();
        job.begin_attempt(Utc::now()).unwrap();
        job
    }

    #[test]
    fn happy_path_sets_timestamps_once() {
        let mut job = processing_job();
        let started = job.started_at.unwrap();
        assert_eq!(job.attempt_count, 1);

        job.requeue(Utc::now()).unwrap();
        job.begin_attempt(Utc::now()).unwrap();
        assert_eq!(job.attempt_count, 2);
        assert_eq!(job.started_at, Some(started));

        job.complete(vec!["s3://results/a.png".into()], Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());
        assert!(job.processing_time().is_some());
        job.check_invariants().unwrap();
    }

    #[test]
    fn completion_requires_results() {
        let mut job = processing_job();
        let err = job.complete(Vec::new(), Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[test]
    fn cannot_complete_a_queued_job() {
        let mut job = test_job();
        job.mark_queued(Utc::now()).unwrap();
        let err = job.complete(vec!["r".into()], Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
    }

    #[test]
    fn terminal_jobs_are_immutable() {
        let mut job = processing_job();
        job.fail(JobError::transient("503"), Utc::now()).unwrap();
        let snapshot = job.clone();

        assert_eq!(job.cancel(Utc::now()).unwrap(), Transition::Unchanged);
        assert_eq!(job.requeue(Utc::now()).unwrap(), Transition::Unchanged);
        assert_eq!(
            job.complete(vec!["r".into()], Utc::now()).unwrap(),
            Transition::Unchanged
        );
        assert_eq!(
            job.request_cancel(Utc::now()),
            CancelOutcome::AlreadyTerminal(JobStatus::Failed)
        );
        assert_eq!(job, snapshot);
    }

    #[test]
    fn cancel_request_depends_on_status() {
        let mut queued = test_job();
        queued.mark_queued(Utc::now()).unwrap();
        assert_eq!(queued.request_cancel(Utc::now()), CancelOutcome::Cancelled);
        assert_eq!(queued.status, JobStatus::Cancelled);

        let mut running = processing_job();
        assert_eq!(running.request_cancel(Utc::now()), CancelOutcome::Requested);
        assert_eq!(running.status, JobStatus::Processing);
        assert!(running.cancel_requested);
        running.cancel(Utc::now()).unwrap();
        assert!(!running.cancel_requested);
    }

    #[test]
    fn progress_never_decreases() {
        let mut job = processing_job();
        assert!(job.record_progress(40));
        assert!(!job.record_progress(20));
        assert!(!job.record_progress(40));
        assert_eq!(job.progress, 40);
        assert!(job.record_progress(250));
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn attempts_are_bounded() {
        let mut job = test_job().with_max_attempts(2);
        job.mark_queued(Utc::now()).unwrap();
        for _ in 0..2 {
            job.begin_attempt(Utc::now()).unwrap();
            job.requeue(Utc::now()).unwrap();
        }
        let err = job.begin_attempt(Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(job.attempt_count, 2);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Queue,
        Begin,
        Requeue,
        Complete(bool),
        Fail,
        Cancel,
        RequestCancel,
        Progress(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Queue),
            Just(Op::Begin),
            Just(Op::Requeue),
            any::<bool>().prop_map(Op::Complete),
            Just(Op::Fail),
            Just(Op::Cancel),
            Just(Op::RequestCancel),
            any::<u8>().prop_map(Op::Progress),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 512,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence of requests hits a job, every observed
        /// status change is an edge of the state machine, the data invariants
        /// hold after each step and terminal states never change.
        #[test]
        fn observed_statuses_form_a_valid_path(ops in prop::collection::vec(op(), 1..40)) {
            let mut job = test_job();
            let mut terminal: Option<Job> = None;

            for op in ops {
                let before = job.status;
                let progress_before = job.progress;
                let now = Utc::now();
                let _ = match op {
                    Op::Queue => job.mark_queued(now).map(|_| ()),
                    Op::Begin => job.begin_attempt(now).map(|_| ()),
                    Op::Requeue => job.requeue(now).map(|_| ()),
                    Op::Complete(with_refs) => {
                        let refs = if with_refs { vec!["s3://r.png".to_string()] } else { Vec::new() };
                        job.complete(refs, now).map(|_| ())
                    }
                    Op::Fail => job.fail(JobError::transient("flaky"), now).map(|_| ()),
                    Op::Cancel => job.cancel(now).map(|_| ()),
                    Op::RequestCancel => { job.request_cancel(now); Ok(()) }
                    Op::Progress(p) => { job.record_progress(p); Ok(()) }
                };

                if job.status != before {
                    prop_assert!(before.can_transition_to(job.status), "{} -> {}", before, job.status);
                }
                prop_assert!(job.progress >= progress_before);
                prop_assert!(job.check_invariants().is_ok(), "{:?}", job.check_invariants());

                if let Some(frozen) = &terminal {
                    prop_assert_eq!(frozen, &job);
                } else if job.status.is_terminal() {
                    terminal = Some(job.clone());
                }
            }
        }
    }

    #[test]
    fn failure_keeps_attribution() {
        let mut job = processing_job();
        job.fail(JobError::permanent(Attribution::Caller, "nsfw"), Utc::now())
            .unwrap();
        assert!(!job.error.as_ref().unwrap().is_refundable());
        job.check_invariants().unwrap();
    }
}
