//! Worker pool: leases admitted jobs and drives each attempt to a verdict.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use productsnap_core::{JobId, WorkerId};
use productsnap_generation::{
    Artifact, GenerationAdapter, GenerationError, GenerationRequest, ProgressReporter,
    ResultPersister, StorageError,
};
use productsnap_jobs::{Job, JobError};

use super::reaper::LeaseReaper;
use super::retry::{Backoff, RetryPolicy};
use crate::admission::AdmissionGate;
use crate::dispatch::{DispatchQueue, Lease};
use crate::jobs::{JobStore, JobStoreError, JobUpdate};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Name for logging
    pub name: String,
    /// Jobs processed in parallel; the pool's only backpressure control.
    pub worker_count: usize,
    /// Deadline for one generation call.
    pub attempt_timeout: Duration,
    /// Idle pause when the queue has nothing ready.
    pub lease_wait: Duration,
    /// How often a held lease is extended while the provider works.
    pub lease_extend_interval: Duration,
    /// Delay before a failed attempt is retried.
    pub backoff: Backoff,
    /// Retries of a single result write.
    pub storage_retry: RetryPolicy,
    /// Retries of a job store write that failed on storage.
    pub store_retry: RetryPolicy,
    /// How often expired leases are swept.
    pub reaper_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "image-workers".to_string(),
            worker_count: 4,
            attempt_timeout: Duration::from_secs(300),
            lease_wait: Duration::from_secs(1),
            lease_extend_interval: Duration::from_secs(60),
            backoff: Backoff::default(),
            storage_retry: RetryPolicy::default(),
            store_retry: RetryPolicy::default(),
            reaper_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_lease_wait(mut self, wait: Duration) -> Self {
        self.lease_wait = wait;
        self
    }

    pub fn with_lease_extend_interval(mut self, interval: Duration) -> Self {
        self.lease_extend_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_storage_retry(mut self, policy: RetryPolicy) -> Self {
        self.storage_retry = policy;
        self
    }

    pub fn with_store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn DispatchQueue>,
    pub generator: Arc<dyn GenerationAdapter>,
    pub persister: Arc<dyn ResultPersister>,
    /// Refunds go back through admission.
    pub gate: Arc<AdmissionGate>,
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    /// Late writes from an attempt the job had already moved past.
    pub stale_results_rejected: u64,
    pub running: usize,
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerPoolHandle {
    /// Stop leasing, let in-flight attempts finish, and return final stats.
    pub async fn shutdown(self) -> WorkerStats {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "worker task panicked");
            }
        }
        self.stats.lock().unwrap().clone()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Fixed-size pool of async workers plus the lease reaper.
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(config: WorkerPoolConfig, deps: WorkerDeps) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let reaper = LeaseReaper::new(deps.store.clone(), deps.queue.clone(), deps.gate.clone());
        let worker = Arc::new(Worker {
            config,
            deps,
            stats: stats.clone(),
        });

        let mut tasks = Vec::with_capacity(worker.config.worker_count + 1);
        for _ in 0..worker.config.worker_count {
            let worker = worker.clone();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                worker.run(WorkerId::new(), shutdown).await
            }));
        }

        let interval = worker.config.reaper_interval;
        let name = worker.config.name.clone();
        tasks.push(tokio::spawn(async move {
            reaper.run(name, interval, shutdown_rx).await
        }));

        info!(
            pool = %worker.config.name,
            workers = worker.config.worker_count,
            provider = worker.deps.generator.name(),
            "worker pool started"
        );

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            tasks,
            stats,
        }
    }
}

/// How one attempt ended, before the verdict is written.
#[derive(Debug)]
enum AttemptOutcome {
    Persisted(Vec<String>),
    Cancelled,
    Generation(GenerationError),
    Storage(StorageError),
}

struct Worker {
    config: WorkerPoolConfig,
    deps: WorkerDeps,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Worker {
    async fn run(&self, worker_id: WorkerId, mut shutdown: watch::Receiver<bool>) {
        debug!(pool = %self.config.name, worker = %worker_id, "worker started");

        while !*shutdown.borrow() {
            let idle = match self.deps.queue.lease(worker_id).await {
                Ok(Some(lease)) => {
                    self.process(worker_id, lease).await;
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    error!(pool = %self.config.name, worker = %worker_id, error = %e, "failed to lease job");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.lease_wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        debug!(pool = %self.config.name, worker = %worker_id, "worker stopped");
    }

    async fn process(&self, worker_id: WorkerId, lease: Lease) {
        let job_id = lease.job_id;
        let update = match self.deps.store.begin_attempt(job_id).await {
            Ok(update) => update,
            Err(JobStoreError::NotFound(_)) => {
                warn!(job_id = %job_id, worker = %worker_id, "leased job does not exist, dropping");
                self.ack(&lease).await;
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, worker = %worker_id, error = %e, "could not start attempt, releasing");
                self.release(&lease, self.config.backoff.delay_for_attempt(lease.deliveries))
                    .await;
                return;
            }
        };

        if !update.applied() {
            debug!(job_id = %job_id, status = %update.job.status, "job already finished, dropping delivery");
            self.ack(&lease).await;
            return;
        }

        let job = update.job;
        let attempt = job.attempt_count;
        info!(
            job_id = %job_id,
            worker = %worker_id,
            attempt,
            max_attempts = job.max_attempts,
            lane = lease.priority.as_str(),
            deliveries = lease.deliveries,
            "attempt started"
        );

        {
            let mut s = self.stats.lock().unwrap();
            s.running += 1;
            s.jobs_processed += 1;
        }

        let outcome = self.run_attempt(&job, &lease).await;
        self.settle(&job, &lease, outcome).await;

        let mut s = self.stats.lock().unwrap();
        s.running = s.running.saturating_sub(1);
    }

    async fn run_attempt(&self, job: &Job, lease: &Lease) -> AttemptOutcome {
        if self.cancel_requested(job.id).await {
            return AttemptOutcome::Cancelled;
        }

        let generated = self.generate(job, lease).await;

        if self.cancel_requested(job.id).await {
            return AttemptOutcome::Cancelled;
        }

        let artifacts = match generated {
            Ok(artifacts) if artifacts.is_empty() => {
                return AttemptOutcome::Generation(GenerationError::Rejected(
                    "provider returned no images".to_string(),
                ));
            }
            Ok(artifacts) => artifacts,
            Err(e) => return AttemptOutcome::Generation(e),
        };

        self.extend(lease).await;
        match self.with_lease(lease, self.persist(job.id, &artifacts)).await {
            Ok(refs) => AttemptOutcome::Persisted(refs),
            Err(e) => AttemptOutcome::Storage(e),
        }
    }

    /// Provider call under the attempt deadline, forwarding progress and
    /// keeping the lease alive until it resolves.
    async fn generate(&self, job: &Job, lease: &Lease) -> Result<Vec<Artifact>, GenerationError> {
        let timeout = self.config.attempt_timeout;
        let (reporter, mut progress) = ProgressReporter::channel();
        let request = GenerationRequest {
            job_id: job.id,
            input_ref: job.input_ref.clone(),
            mode: job.mode,
            parameters: job.parameters.clone(),
            timeout,
        };

        let call = tokio::time::timeout(timeout, self.deps.generator.generate(request, reporter));
        tokio::pin!(call);

        let mut keepalive = self.keepalive();
        let result = loop {
            tokio::select! {
                result = &mut call => {
                    break result.unwrap_or(Err(GenerationError::Timeout(timeout)));
                }
                Some(percent) = progress.recv() => {
                    self.forward_progress(job, percent).await;
                }
                _ = keepalive.tick() => {
                    self.extend(lease).await;
                }
            }
        };

        while let Ok(percent) = progress.try_recv() {
            self.forward_progress(job, percent).await;
        }
        result
    }

    fn keepalive(&self) -> Interval {
        let period = self.config.lease_extend_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive
    }

    /// Run `work` while extending the lease on every keepalive tick.
    async fn with_lease<T>(&self, lease: &Lease, work: impl Future<Output = T>) -> T {
        tokio::pin!(work);
        let mut keepalive = self.keepalive();
        loop {
            tokio::select! {
                out = &mut work => return out,
                _ = keepalive.tick() => {
                    self.extend(lease).await;
                }
            }
        }
    }

    async fn forward_progress(&self, job: &Job, percent: u8) {
        match self
            .deps
            .store
            .record_progress(job.id, job.attempt_count, percent)
            .await
        {
            Ok(true) => debug!(job_id = %job.id, progress = percent, "progress recorded"),
            Ok(false) => {}
            Err(e) => debug!(job_id = %job.id, error = %e, "progress update dropped"),
        }
    }

    /// Write every artifact, retrying storage failures without regenerating.
    async fn persist(&self, job_id: JobId, artifacts: &[Artifact]) -> Result<Vec<String>, StorageError> {
        let policy = &self.config.storage_retry;
        let mut refs = Vec::with_capacity(artifacts.len());

        for artifact in artifacts {
            let mut tries = 1;
            let stable = loop {
                let write = tokio::time::timeout(
                    self.config.attempt_timeout,
                    self.deps.persister.store(job_id, artifact),
                )
                .await
                .unwrap_or_else(|_| Err(StorageError::Unavailable("result write timed out".to_string())));

                match write {
                    Ok(stable) => break stable,
                    Err(e) if e.is_retriable() && policy.should_retry(tries) => {
                        let delay = policy.backoff.delay_for_attempt(tries);
                        warn!(job_id = %job_id, tries, error = %e, delay_ms = delay.as_millis() as u64, "result write failed, retrying");
                        tokio::time::sleep(delay).await;
                        tries += 1;
                    }
                    Err(e) => return Err(e),
                }
            };
            refs.push(stable.into_string());
        }

        Ok(refs)
    }

    async fn settle(&self, job: &Job, lease: &Lease, outcome: AttemptOutcome) {
        let job_id = job.id;
        let attempt = job.attempt_count;

        match outcome {
            AttemptOutcome::Persisted(refs) => {
                let count = refs.len();
                let write = self
                    .write(|| self.deps.store.complete(job_id, attempt, refs.clone()))
                    .await;
                let Some(update) = self.verdict(job, write) else {
                    return;
                };
                if update.applied() {
                    self.stats.lock().unwrap().completed += 1;
                    info!(job_id = %job_id, attempt, results = count, "job completed");
                }
                self.ack(lease).await;
            }
            AttemptOutcome::Cancelled => {
                let write = self
                    .write(|| self.deps.store.finish_cancel(job_id, attempt))
                    .await;
                let Some(update) = self.verdict(job, write) else {
                    return;
                };
                if update.applied() {
                    self.stats.lock().unwrap().cancelled += 1;
                    info!(job_id = %job_id, attempt, "job cancelled at checkpoint");
                    self.refund(&update.job).await;
                }
                self.ack(lease).await;
            }
            AttemptOutcome::Generation(e) if e.is_transient() && job.has_attempts_left() => {
                let write = self.write(|| self.deps.store.requeue(job_id, attempt)).await;
                let Some(update) = self.verdict(job, write) else {
                    return;
                };
                if !update.applied() {
                    self.ack(lease).await;
                    return;
                }
                let delay = self.config.backoff.delay_honouring(attempt, e.retry_after());
                self.stats.lock().unwrap().retried += 1;
                warn!(
                    job_id = %job_id,
                    attempt,
                    max_attempts = job.max_attempts,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed, retrying"
                );
                self.release(lease, delay).await;
            }
            AttemptOutcome::Generation(e) => {
                self.fail(job, lease, e.to_job_error()).await;
            }
            AttemptOutcome::Storage(e) => {
                self.fail(job, lease, JobError::storage(e.to_string())).await;
            }
        }
    }

    async fn fail(&self, job: &Job, lease: &Lease, error: JobError) {
        let job_id = job.id;
        let attempt = job.attempt_count;
        let write = self
            .write(|| self.deps.store.fail(job_id, attempt, error.clone()))
            .await;
        let Some(update) = self.verdict(job, write) else {
            return;
        };
        if update.applied() {
            self.stats.lock().unwrap().failed += 1;
            warn!(
                job_id = %job_id,
                attempt,
                class = ?error.class,
                attribution = ?error.attribution,
                error = %error.message,
                "job failed"
            );
            if error.is_refundable() {
                self.refund(&update.job).await;
            }
        }
        self.ack(lease).await;
    }

    /// Sort a verdict write into applied/unchanged or a rejection.
    ///
    /// A rejected write means another attempt owns the job now; the lease
    /// this worker held is gone with it, so nothing is acked.
    fn verdict(&self, job: &Job, write: Result<JobUpdate, JobStoreError>) -> Option<JobUpdate> {
        match write {
            Ok(update) => Some(update),
            Err(e @ (JobStoreError::StaleAttempt { .. } | JobStoreError::InvalidTransition { .. })) => {
                self.stats.lock().unwrap().stale_results_rejected += 1;
                warn!(job_id = %job.id, attempt = job.attempt_count, error = %e, "stale attempt result rejected");
                None
            }
            Err(e) => {
                // The lease is left to expire; the reaper requeues the job.
                error!(job_id = %job.id, attempt = job.attempt_count, error = %e, "failed to record attempt verdict");
                None
            }
        }
    }

    /// Retry a job store write that failed on storage.
    async fn write<F, Fut>(&self, mut op: F) -> Result<JobUpdate, JobStoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<JobUpdate, JobStoreError>>,
    {
        let policy = &self.config.store_retry;
        let mut tries = 1;
        loop {
            match op().await {
                Err(JobStoreError::Storage(msg)) if policy.should_retry(tries) => {
                    warn!(tries, error = %msg, "job store write failed, retrying");
                    tokio::time::sleep(policy.backoff.delay_for_attempt(tries)).await;
                    tries += 1;
                }
                result => return result,
            }
        }
    }

    async fn cancel_requested(&self, job_id: JobId) -> bool {
        match self.deps.store.get(job_id).await {
            Ok(Some(job)) => job.cancel_requested,
            Ok(None) => false,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "cancellation check failed");
                false
            }
        }
    }

    async fn refund(&self, job: &Job) {
        if let Err(e) = self.deps.gate.refund(job).await {
            error!(job_id = %job.id, owner_id = %job.owner_id, error = %e, "quota refund failed");
        }
    }

    async fn ack(&self, lease: &Lease) {
        if let Err(e) = self.deps.queue.ack(lease.job_id, lease.token).await {
            warn!(job_id = %lease.job_id, error = %e, "failed to ack lease");
        }
    }

    async fn extend(&self, lease: &Lease) {
        if let Err(e) = self.deps.queue.extend(lease.job_id, lease.token).await {
            warn!(job_id = %lease.job_id, error = %e, "failed to extend lease");
        }
    }

    async fn release(&self, lease: &Lease, delay: Duration) {
        if let Err(e) = self.deps.queue.release(lease.job_id, lease.token, delay).await {
            warn!(job_id = %lease.job_id, error = %e, "failed to release lease");
        }
    }
}
