//! In-memory job queue implementation for testing.
//!
//! This module provides [`InMemoryJobQueue`], a simple in-memory implementation
//! of the [`JobQueue`] trait suitable for testing and single-process deployments.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence, no distribution
//! - **Single-process only**: Jobs are not visible across process boundaries
//! - **Deduplication is queue-scoped**: Keys are released when jobs are received
//! - **Bounded bookkeeping**: Revocations and progress are forgotten once they
//!   are older than the retention window

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use ulid::Ulid;

use super::{JobDescriptor, JobProgress, JobQueue, ReceivedJob, SubmitOptions, SubmitResult};
use crate::error::{Error, Result};

/// How long revocations and progress reports are kept.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
struct QueuedJob {
    job: ReceivedJob,
    idempotency_key: String,
    visible_at: Instant,
    sequence: u64,
}

/// Internal queue state protected by a single lock.
#[derive(Debug, Default)]
struct QueueState {
    jobs: Vec<QueuedJob>,
    seen_keys: HashMap<String, String>,
    revoked: HashMap<String, Instant>,
    progress: HashMap<String, (JobProgress, Instant)>,
    next_sequence: u64,
}

impl QueueState {
    fn prune(&mut self, now: Instant, retention: Duration) {
        self.revoked
            .retain(|_, at| now.saturating_duration_since(*at) < retention);
        self.progress
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < retention);
    }
}

/// In-memory job queue for testing.
///
/// Delays and retention are measured with `tokio::time::Instant`, so
/// paused-clock tests can advance past them.
///
/// ## Example
///
/// ```rust
/// use tollgate_flow::dispatch::memory::InMemoryJobQueue;
///
/// let queue = InMemoryJobQueue::new("ml");
/// ```
#[derive(Debug)]
pub struct InMemoryJobQueue {
    name: String,
    retention: Duration,
    state: RwLock<QueueState>,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new("ml")
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("job queue lock poisoned")
}

impl InMemoryJobQueue {
    /// Creates a new in-memory job queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retention: DEFAULT_RETENTION,
            state: RwLock::new(QueueState::default()),
        }
    }

    /// Sets how long revocations and progress reports are kept.
    ///
    /// A revoked job resubmitted after this window is delivered again.
    #[must_use]
    pub const fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Generates a new message ID.
    fn generate_message_id() -> String {
        Ulid::new().to_string()
    }

    /// Returns every queued job, visible or not, in submission order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn snapshot(&self) -> Result<Vec<ReceivedJob>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut jobs: Vec<_> = state.jobs.iter().collect();
        jobs.sort_by_key(|j| j.sequence);
        let result = jobs.into_iter().map(|j| j.job.clone()).collect();
        drop(state);
        Ok(result)
    }

    /// Returns true if a job ID has been revoked.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_revoked(&self, job_id: &str) -> Result<bool> {
        let now = Instant::now();
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .revoked
            .get(job_id)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.retention))
    }

    /// Returns how many revocations and progress reports are held.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn bookkeeping_len(&self) -> Result<(usize, usize)> {
        let state = self.state.read().map_err(poison_err)?;
        Ok((state.revoked.len(), state.progress.len()))
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn submit(&self, job: JobDescriptor, options: SubmitOptions) -> Result<SubmitResult> {
        let idempotency_key = job.idempotency_key();

        let mut state = self.state.write().map_err(poison_err)?;
        state.prune(Instant::now(), self.retention);

        if let Some(existing) = state.seen_keys.get(&idempotency_key) {
            let existing_message_id = existing.clone();
            drop(state);
            return Ok(SubmitResult::Deduplicated {
                existing_message_id,
            });
        }

        let message_id = Self::generate_message_id();
        let visible_at = options
            .delay
            .map_or_else(Instant::now, |delay| Instant::now() + delay);
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state
            .seen_keys
            .insert(idempotency_key.clone(), message_id.clone());
        state.jobs.push(QueuedJob {
            job: ReceivedJob {
                message_id: message_id.clone(),
                descriptor: job,
                options,
            },
            idempotency_key,
            visible_at,
            sequence,
        });
        drop(state);

        Ok(SubmitResult::Submitted { message_id })
    }

    async fn revoke(&self, job_id: &str) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state.write().map_err(poison_err)?;
        state.prune(now, self.retention);
        let known = state.jobs.iter().any(|j| j.job.descriptor.job_id == job_id)
            || state.progress.contains_key(job_id);
        state.revoked.insert(job_id.to_string(), now);

        let QueueState {
            jobs, seen_keys, ..
        } = &mut *state;
        jobs.retain(|j| {
            let keep = j.job.descriptor.job_id != job_id;
            if !keep {
                seen_keys.remove(&j.idempotency_key);
            }
            keep
        });
        drop(state);
        Ok(known)
    }

    async fn report_progress(&self, job_id: &str, progress: JobProgress) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.write().map_err(poison_err)?;
        state.prune(now, self.retention);
        state.progress.insert(job_id.to_string(), (progress, now));
        drop(state);
        Ok(())
    }

    async fn progress(&self, job_id: &str) -> Result<Option<JobProgress>> {
        let now = Instant::now();
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .progress
            .get(job_id)
            .filter(|(_, at)| now.saturating_duration_since(*at) < self.retention)
            .map(|(progress, _)| *progress))
    }

    async fn receive(&self) -> Result<Option<ReceivedJob>> {
        let now = Instant::now();
        let mut state = self.state.write().map_err(poison_err)?;
        state.prune(now, self.retention);

        let QueueState {
            jobs,
            seen_keys,
            revoked,
            ..
        } = &mut *state;
        jobs.retain(|j| {
            let keep = !revoked.contains_key(&j.job.descriptor.job_id);
            if !keep {
                seen_keys.remove(&j.idempotency_key);
            }
            keep
        });

        let next = state
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.visible_at <= now)
            .max_by(|(_, a), (_, b)| {
                a.job
                    .options
                    .priority_weight
                    .cmp(&b.job.options.priority_weight)
                    .then(b.sequence.cmp(&a.sequence))
            })
            .map(|(i, _)| i);

        let Some(index) = next else {
            drop(state);
            return Ok(None);
        };

        let queued = state.jobs.remove(index);
        state.seen_keys.remove(&queued.idempotency_key);
        drop(state);
        Ok(Some(queued.job))
    }

    async fn lane_depth(&self, lane: &str) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.jobs.iter().filter(|j| j.job.options.lane == lane).count())
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}
