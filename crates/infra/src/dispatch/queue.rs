//! Lease-based dispatch queue with two priority lanes.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use productsnap_core::{DomainError, JobId, LeaseToken, WorkerId};
use productsnap_jobs::PlanTier;

/// Dispatch lane. Paid jobs go first unless a free job has aged out.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Paid,
    Free,
}

impl Priority {
    pub fn for_tier(tier: PlanTier) -> Self {
        if tier.is_paid() {
            Priority::Paid
        } else {
            Priority::Free
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Paid => "paid",
            Priority::Free => "free",
        }
    }
}

impl core::str::FromStr for Priority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paid" => Ok(Priority::Paid),
            "free" => Ok(Priority::Free),
            other => Err(DomainError::validation(format!("unknown lane: {other}"))),
        }
    }
}

/// A time-bounded claim on one queued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub token: LeaseToken,
    pub worker_id: WorkerId,
    pub priority: Priority,
    /// How many times this entry has been handed out, this one included.
    pub deliveries: u32,
    /// Whether a free-lane job was served ahead of paid work by aging.
    pub promoted: bool,
}

/// A lease whose visibility timeout passed without ack or extend.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExpiredLease {
    pub job_id: JobId,
    pub token: LeaseToken,
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub paid: usize,
    pub free: usize,
    pub leased: usize,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("job already queued: {0}")]
    AlreadyQueued(JobId),
    #[error("lease no longer held for job {0}")]
    LeaseLost(JobId),
    #[error("queue storage error: {0}")]
    Storage(String),
}

/// Queue timing knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// A lease not acked or extended within this window is redeliverable.
    pub visibility_timeout: Duration,
    /// A free-lane job ready for longer than this is served before paid work.
    pub free_lane_aging: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(360),
            free_lane_aging: Duration::from_secs(120),
        }
    }
}

/// Holds admitted jobs until a worker leases them.
///
/// Delivery is at-least-once: a lease that expires is reclaimed and handed
/// to another worker. Every delivery carries a fresh [`LeaseToken`]; only the
/// current token can ack, extend or release the entry.
#[async_trait]
pub trait DispatchQueue: Send + Sync + 'static {
    async fn enqueue(&self, job_id: JobId, priority: Priority) -> Result<(), QueueError>;

    /// Next ready job, or `None` when nothing is ready.
    async fn lease(&self, worker_id: WorkerId) -> Result<Option<Lease>, QueueError>;

    /// Done with the job; drop it from the queue.
    async fn ack(&self, job_id: JobId, token: LeaseToken) -> Result<(), QueueError>;

    /// Push the visibility deadline out by another timeout window.
    async fn extend(&self, job_id: JobId, token: LeaseToken) -> Result<(), QueueError>;

    /// Give the job back for another delivery after `delay`.
    async fn release(
        &self,
        job_id: JobId,
        token: LeaseToken,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Drop a job that is not currently leased. Returns whether it was removed.
    async fn remove(&self, job_id: JobId) -> Result<bool, QueueError>;

    async fn expired_leases(&self) -> Result<Vec<ExpiredLease>, QueueError>;

    /// Make an expired lease's job ready again. Returns false if the lease
    /// was acked, released or extended in the meantime.
    async fn reclaim(&self, job_id: JobId, token: LeaseToken) -> Result<bool, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}

#[derive(Debug, Clone)]
struct Held {
    token: LeaseToken,
    worker_id: WorkerId,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct Entry {
    priority: Priority,
    available_at: Instant,
    seq: u64,
    deliveries: u32,
    held: Option<Held>,
}

type ReadyKey = (Instant, u64, JobId);

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<JobId, Entry>,
    paid: BTreeSet<ReadyKey>,
    free: BTreeSet<ReadyKey>,
    next_seq: u64,
}

impl QueueState {
    fn lane_mut(&mut self, priority: Priority) -> &mut BTreeSet<ReadyKey> {
        match priority {
            Priority::Paid => &mut self.paid,
            Priority::Free => &mut self.free,
        }
    }

    /// Put `job_id` back in its lane, ready at `available_at`.
    fn make_ready(&mut self, job_id: JobId, available_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let Some(entry) = self.entries.get_mut(&job_id) else {
            return;
        };
        entry.held = None;
        entry.available_at = available_at;
        entry.seq = seq;
        let priority = entry.priority;
        self.lane_mut(priority).insert((available_at, seq, job_id));
    }

    fn held_by(&mut self, job_id: JobId, token: LeaseToken) -> Result<&mut Entry, QueueError> {
        match self.entries.get_mut(&job_id) {
            Some(entry) if entry.held.as_ref().is_some_and(|h| h.token == token) => Ok(entry),
            _ => Err(QueueError::LeaseLost(job_id)),
        }
    }
}

fn first_ready(lane: &BTreeSet<ReadyKey>, now: Instant) -> Option<ReadyKey> {
    lane.first().copied().filter(|(at, _, _)| *at <= now)
}

/// Single-process queue; one mutex arbitrates lease acquisition.
#[derive(Debug)]
pub struct InMemoryDispatchQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl Default for InMemoryDispatchQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl InMemoryDispatchQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.state.lock().unwrap().entries.contains_key(&job_id)
    }
}

#[async_trait]
impl DispatchQueue for InMemoryDispatchQueue {
    async fn enqueue(&self, job_id: JobId, priority: Priority) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.entries.contains_key(&job_id) {
            return Err(QueueError::AlreadyQueued(job_id));
        }
        let now = Instant::now();
        state.entries.insert(
            job_id,
            Entry {
                priority,
                available_at: now,
                seq: 0,
                deliveries: 0,
                held: None,
            },
        );
        state.make_ready(job_id, now);
        Ok(())
    }

    async fn lease(&self, worker_id: WorkerId) -> Result<Option<Lease>, QueueError> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        let free = first_ready(&state.free, now);
        let aged = free.filter(|(ready_at, _, _)| {
            now.saturating_duration_since(*ready_at) > self.config.free_lane_aging
        });
        let (key, lane, promoted) = match (aged, first_ready(&state.paid, now), free) {
            (Some(key), _, _) => (key, Priority::Free, true),
            (None, Some(key), _) => (key, Priority::Paid, false),
            (None, None, Some(key)) => (key, Priority::Free, false),
            (None, None, None) => return Ok(None),
        };
        state.lane_mut(lane).remove(&key);

        let job_id = key.2;
        let token = LeaseToken::new();
        let entry = state
            .entries
            .get_mut(&job_id)
            .ok_or_else(|| QueueError::Storage(format!("ready index out of sync for {job_id}")))?;
        entry.deliveries += 1;
        entry.held = Some(Held {
            token,
            worker_id,
            expires_at: now + self.config.visibility_timeout,
        });

        Ok(Some(Lease {
            job_id,
            token,
            worker_id,
            priority: entry.priority,
            deliveries: entry.deliveries,
            promoted,
        }))
    }

    async fn ack(&self, job_id: JobId, token: LeaseToken) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.held_by(job_id, token)?;
        state.entries.remove(&job_id);
        Ok(())
    }

    async fn extend(&self, job_id: JobId, token: LeaseToken) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let entry = state.held_by(job_id, token)?;
        match entry.held.as_mut() {
            Some(held) if held.expires_at > now => {
                held.expires_at = now + self.config.visibility_timeout;
                Ok(())
            }
            _ => Err(QueueError::LeaseLost(job_id)),
        }
    }

    async fn release(
        &self,
        job_id: JobId,
        token: LeaseToken,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.held_by(job_id, token)?;
        state.make_ready(job_id, Instant::now() + delay);
        Ok(())
    }

    async fn remove(&self, job_id: JobId) -> Result<bool, QueueError> {
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.entries.get(&job_id) else {
            return Ok(false);
        };
        if entry.held.is_some() {
            return Ok(false);
        }
        let key = (entry.available_at, entry.seq, job_id);
        let priority = entry.priority;
        state.lane_mut(priority).remove(&key);
        state.entries.remove(&job_id);
        Ok(true)
    }

    async fn expired_leases(&self) -> Result<Vec<ExpiredLease>, QueueError> {
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        let mut expired: Vec<_> = state
            .entries
            .iter()
            .filter_map(|(job_id, entry)| {
                let held = entry.held.as_ref()?;
                (held.expires_at <= now).then_some(ExpiredLease {
                    job_id: *job_id,
                    token: held.token,
                    worker_id: held.worker_id,
                })
            })
            .collect();
        expired.sort_by_key(|l| l.job_id);
        Ok(expired)
    }

    async fn reclaim(&self, job_id: JobId, token: LeaseToken) -> Result<bool, QueueError> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let expired = state
            .entries
            .get(&job_id)
            .and_then(|e| e.held.as_ref())
            .is_some_and(|h| h.token == token && h.expires_at <= now);
        if !expired {
            return Ok(false);
        }
        state.make_ready(job_id, now);
        Ok(true)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let state = self.state.lock().unwrap();
        let leased = state.entries.values().filter(|e| e.held.is_some()).count();
        Ok(QueueDepth {
            paid: state.paid.len(),
            free: state.free.len(),
            leased,
        })
    }
}

#[async_trait]
impl<Q: DispatchQueue> DispatchQueue for Arc<Q> {
    async fn enqueue(&self, job_id: JobId, priority: Priority) -> Result<(), QueueError> {
        (**self).enqueue(job_id, priority).await
    }

    async fn lease(&self, worker_id: WorkerId) -> Result<Option<Lease>, QueueError> {
        (**self).lease(worker_id).await
    }

    async fn ack(&self, job_id: JobId, token: LeaseToken) -> Result<(), QueueError> {
        (**self).ack(job_id, token).await
    }

    async fn extend(&self, job_id: JobId, token: LeaseToken) -> Result<(), QueueError> {
        (**self).extend(job_id, token).await
    }

    async fn release(
        &self,
        job_id: JobId,
        token: LeaseToken,
        delay: Duration,
    ) -> Result<(), QueueError> {
        (**self).release(job_id, token, delay).await
    }

    async fn remove(&self, job_id: JobId) -> Result<bool, QueueError> {
        (**self).remove(job_id).await
    }

    async fn expired_leases(&self) -> Result<Vec<ExpiredLease>, QueueError> {
        (**self).expired_leases().await
    }

    async fn reclaim(&self, job_id: JobId, token: LeaseToken) -> Result<bool, QueueError> {
        (**self).reclaim(job_id, token).await
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        (**self).depth().await
    }
}
