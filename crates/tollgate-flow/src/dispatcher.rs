//! Priority lanes with capacity ceilings in front of the job queue.
//!
//! The dispatcher owns the process-wide lane statistics: outstanding job
//! count, ceiling and an exponential moving average of observed wait time.
//!
//! ## Design Principles
//!
//! - **Serialized admission**: Admissions for one user run under that user's
//!   advisory lock, and check, submit and increment for a lane run under that
//!   lane's async gate, so neither ceiling is exceeded by concurrent enqueues
//! - **Count after success**: A failed submit leaves the count untouched
//! - **Injected, not global**: Stats live in the dispatcher instance
//!
//! ```text
//! enqueue ──▶ [user lock: (insert) ─▶ user limit ─▶ [lane gate: ceiling ─▶ submit ─▶ size += 1]]
//! worker  ──▶ record_completion (EMA, size -= 1) | release (size -= 1)
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use tollgate_core::lock::{DEFAULT_LOCK_TTL, DEFAULT_MAX_RETRIES};
use tollgate_core::{AdvisoryLock, InMemoryAdvisoryLock, UserId};

use crate::config::{FlowConfig, LaneCapacities};
use crate::dispatch::{JobDescriptor, JobQueue, SubmitOptions};
use crate::error::{CapacityReason, Error, Result};
use crate::metrics::FlowMetrics;
use crate::store::TaskStore;
use crate::task::{Priority, Task};

/// Weight of the previous average in the wait EMA.
const EMA_DECAY: f64 = 0.9;

/// Snapshot of one lane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LaneStats {
    /// Outstanding jobs (enqueued and not yet completed or released).
    pub size: usize,
    /// Ceiling on `size`.
    pub capacity: usize,
    /// Moving average of queue wait in seconds.
    pub avg_wait_secs: f64,
}

impl LaneStats {
    const fn new(capacity: usize, avg_wait_secs: f64) -> Self {
        Self {
            size: 0,
            capacity,
            avg_wait_secs,
        }
    }

    /// Returns true if the lane is at its ceiling.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.size >= self.capacity
    }
}

/// Lock key serializing one user's admissions.
#[must_use]
pub fn admission_lock_key(user_id: &UserId) -> String {
    format!("admission:{user_id}")
}

/// Initial average wait for a lane before any completion is observed.
#[must_use]
pub const fn initial_avg_wait(priority: Priority) -> f64 {
    match priority {
        Priority::Low => 300.0,
        Priority::Normal => 120.0,
        Priority::High => 30.0,
    }
}

#[derive(Debug)]
struct Lane {
    priority: Priority,
    gate: tokio::sync::Mutex<()>,
    stats: Mutex<LaneStats>,
}

impl Lane {
    fn new(priority: Priority, capacity: usize) -> Self {
        Self {
            priority,
            gate: tokio::sync::Mutex::new(()),
            stats: Mutex::new(LaneStats::new(capacity, initial_avg_wait(priority))),
        }
    }

    fn snapshot(&self) -> LaneStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<R>(&self, f: impl FnOnce(&mut LaneStats) -> R) -> R {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats)
    }
}

/// Admits tasks into priority lanes and tracks lane statistics.
pub struct PriorityDispatcher {
    queue: Arc<dyn JobQueue>,
    tasks: Arc<dyn TaskStore>,
    admissions: Arc<dyn AdvisoryLock>,
    lanes: [Lane; 3],
    user_limit: usize,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for PriorityDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityDispatcher")
            .field("queue", &self.queue.queue_name())
            .field("user_limit", &self.user_limit)
            .field("lanes", &self.lane_sizes())
            .finish_non_exhaustive()
    }
}

impl PriorityDispatcher {
    /// Creates a dispatcher with default ceilings.
    #[must_use]
    pub fn new(queue: Arc<dyn JobQueue>, tasks: Arc<dyn TaskStore>) -> Self {
        Self::with_limits(queue, tasks, LaneCapacities::default(), 10)
    }

    /// Creates a dispatcher from configuration.
    #[must_use]
    pub fn from_config(
        queue: Arc<dyn JobQueue>,
        tasks: Arc<dyn TaskStore>,
        config: &FlowConfig,
    ) -> Self {
        Self::with_limits(queue, tasks, config.lane_capacities, config.user_task_limit)
    }

    /// Creates a dispatcher with explicit ceilings.
    #[must_use]
    pub fn with_limits(
        queue: Arc<dyn JobQueue>,
        tasks: Arc<dyn TaskStore>,
        capacities: LaneCapacities,
        user_limit: usize,
    ) -> Self {
        let lanes = Priority::ALL.map(|p| Lane::new(p, capacities.for_priority(p)));
        Self {
            queue,
            tasks,
            admissions: Arc::new(InMemoryAdvisoryLock::new()),
            lanes,
            user_limit,
            metrics: FlowMetrics::new(),
        }
    }

    /// Uses a shared lock for per-user admissions instead of a private one.
    ///
    /// Every dispatcher admitting tasks for the same users must share it.
    #[must_use]
    pub fn with_admission_lock(mut self, lock: Arc<dyn AdvisoryLock>) -> Self {
        self.admissions = lock;
        self
    }

    fn lane(&self, priority: Priority) -> &Lane {
        &self.lanes[priority.index()]
    }

    /// Returns the job queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Admits a task into its lane and submits its job.
    ///
    /// Returns the external job ID. The user limit counts the user's stored
    /// active tasks, so the task should already be stored.
    ///
    /// # Errors
    ///
    /// - [`Error::Capacity`] with [`CapacityReason::UserLimit`] if the user has too
    ///   many outstanding tasks (the task itself is not counted)
    /// - [`Error::Capacity`] with [`CapacityReason::LaneFull`] if the lane is full
    /// - [`Error::ConcurrentModification`] if the user's admission lock stays held
    /// - Submission errors from the job queue, unchanged
    #[tracing::instrument(
        skip(self, task),
        fields(task_id = %task.id, user_id = %task.user_id, priority = %task.priority)
    )]
    pub async fn enqueue(&self, task: &Task) -> Result<String> {
        self.gated(&task.user_id, self.admit(task)).await
    }

    /// Stores a new task and admits it in one step under the user's
    /// admission lock.
    ///
    /// A task that is stored but not admitted is deleted again.
    ///
    /// # Errors
    ///
    /// Store errors from the insert, then the same as
    /// [`PriorityDispatcher::enqueue`].
    #[tracing::instrument(
        skip(self, task),
        fields(task_id = %task.id, user_id = %task.user_id, priority = %task.priority)
    )]
    pub async fn insert_and_enqueue(&self, task: &Task) -> Result<String> {
        self.gated(&task.user_id, async {
            self.tasks.insert(task).await?;
            match self.admit(task).await {
                Ok(job_id) => Ok(job_id),
                Err(err) => {
                    if let Err(delete_err) = self.tasks.delete(&task.id).await {
                        tracing::error!(task_id = %task.id, error = %delete_err, "failed to delete unadmitted task");
                    }
                    Err(err)
                }
            }
        })
        .await
    }

    async fn gated<T, Fut>(&self, user_id: &UserId, admission: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let key = admission_lock_key(user_id);
        let guard = match self
            .admissions
            .acquire(&key, DEFAULT_LOCK_TTL, DEFAULT_MAX_RETRIES)
            .await
        {
            Ok(guard) => guard,
            Err(tollgate_core::Error::LockContended { .. }) => {
                return Err(Error::ConcurrentModification { user_id: *user_id });
            }
            Err(err) => return Err(err.into()),
        };

        let result = admission.await;
        match self.admissions.release(&guard).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(%user_id, "admission lock lease expired before release"),
            Err(err) => tracing::warn!(%user_id, error = %err, "failed to release admission lock"),
        }
        result
    }

    async fn admit(&self, task: &Task) -> Result<String> {
        let current = self
            .tasks
            .count_active_for_user(&task.user_id, Some(&task.id))
            .await?;
        if current >= self.user_limit {
            self.metrics.record_enqueue(task.priority.lane(), "user_limit");
            return Err(Error::Capacity {
                reason: CapacityReason::UserLimit {
                    current,
                    limit: self.user_limit,
                },
            });
        }

        let lane = self.lane(task.priority);
        let _gate = lane.gate.lock().await;

        let stats = lane.snapshot();
        if stats.is_full() {
            self.metrics.record_enqueue(task.priority.lane(), "lane_full");
            return Err(Error::Capacity {
                reason: CapacityReason::LaneFull {
                    lane: task.priority.lane().to_string(),
                    capacity: stats.capacity,
                },
            });
        }

        let job = JobDescriptor::for_task(task);
        let job_id = job.job_id.clone();
        self.queue
            .submit(job, SubmitOptions::for_priority(task.priority))
            .await?;

        let size = lane.update(|s| {
            s.size += 1;
            s.size
        });
        self.metrics.record_enqueue(task.priority.lane(), "accepted");
        self.metrics.set_lane_depth(task.priority.lane(), size);
        tracing::info!(%job_id, lane_size = size, "task enqueued");
        Ok(job_id)
    }

    /// Resubmits a job for another attempt after `delay`.
    ///
    /// The lane slot taken by the first enqueue is still held, so the lane
    /// count is not touched.
    ///
    /// # Errors
    ///
    /// Returns submission errors from the job queue.
    pub async fn resubmit(&self, job: &JobDescriptor, delay: Duration) -> Result<JobDescriptor> {
        let next = job.next_attempt();
        self.queue
            .submit(
                next.clone(),
                SubmitOptions::for_priority(next.priority).with_delay(delay),
            )
            .await?;
        Ok(next)
    }

    /// Estimated wait in seconds for a new job on the lane.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn estimate_wait(&self, priority: Priority) -> f64 {
        let stats = self.lane(priority).snapshot();
        stats.avg_wait_secs * (1.0 + stats.size as f64 / 10.0)
    }

    /// Folds an observed wait into the lane average and frees the slot.
    pub fn record_completion(&self, priority: Priority, actual_wait_secs: f64) {
        let lane = self.lane(priority);
        let (stats, underflow) = lane.update(|s| {
            s.avg_wait_secs = EMA_DECAY.mul_add(s.avg_wait_secs, (1.0 - EMA_DECAY) * actual_wait_secs);
            let underflow = s.size == 0;
            s.size = s.size.saturating_sub(1);
            (*s, underflow)
        });
        if underflow {
            tracing::warn!(lane = priority.lane(), "completion recorded on an empty lane");
        }
        self.metrics.set_lane_depth(priority.lane(), stats.size);
        self.metrics
            .set_lane_avg_wait(priority.lane(), stats.avg_wait_secs);
    }

    /// Frees a lane slot without touching the wait average.
    pub fn release(&self, priority: Priority) {
        let lane = self.lane(priority);
        let (size, underflow) = lane.update(|s| {
            let underflow = s.size == 0;
            s.size = s.size.saturating_sub(1);
            (s.size, underflow)
        });
        if underflow {
            tracing::warn!(lane = priority.lane(), "release recorded on an empty lane");
        }
        self.metrics.set_lane_depth(priority.lane(), size);
    }

    /// Snapshot of every lane's outstanding count.
    #[must_use]
    pub fn lane_sizes(&self) -> BTreeMap<Priority, usize> {
        self.lanes
            .iter()
            .map(|lane| (lane.priority, lane.snapshot().size))
            .collect()
    }

    /// Snapshot of one lane.
    #[must_use]
    pub fn lane_stats(&self, priority: Priority) -> LaneStats {
        self.lane(priority).snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::memory::InMemoryJobQueue;
    use crate::store::memory::InMemoryTaskStore;
    use crate::task::{Payload, TaskInput};
    use tollgate_core::ModelId;

    fn dispatcher(capacities: LaneCapacities, user_limit: usize) -> (PriorityDispatcher, Arc<InMemoryTaskStore>) {
        let store = Arc::new(InMemoryTaskStore::new());
        let dispatcher = PriorityDispatcher::with_limits(
            Arc::new(InMemoryJobQueue::new("test")),
            store.clone(),
            capacities,
            user_limit,
        );
        (dispatcher, store)
    }

    fn task(user: UserId, priority: Priority) -> Task {
        Task::new(user, ModelId::generate(), TaskInput::Single(Payload::new()), priority)
    }

    #[tokio::test]
    async fn enqueue_increments_lane() {
        let (dispatcher, _) = dispatcher(LaneCapacities::default(), 10);
        let task = task(UserId::generate(), Priority::Normal);

        let job_id = dispatcher.enqueue(&task).await.unwrap();
        assert_eq!(job_id, task.id.to_string());
        assert_eq!(dispatcher.lane_stats(Priority::Normal).size, 1);
        assert_eq!(dispatcher.queue().lane_depth("ml_normal").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn full_lane_rejects_without_change() {
        let capacities = LaneCapacities {
            low: 10,
            normal: 10,
            high: 2,
        };
        let (dispatcher, _) = dispatcher(capacities, 100);
        for _ in 0..2 {
            dispatcher
                .enqueue(&task(UserId::generate(), Priority::High))
                .await
                .unwrap();
        }

        let err = dispatcher
            .enqueue(&task(UserId::generate(), Priority::High))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Capacity {
                reason: CapacityReason::LaneFull { ref lane, capacity: 2 }
            } if lane == "ml_high"
        ));
        assert_eq!(dispatcher.lane_stats(Priority::High).size, 2);
        assert_eq!(dispatcher.lane_stats(Priority::Low).size, 0);
    }

    #[tokio::test]
    async fn user_limit_excludes_current_task() {
        let (dispatcher, store) = dispatcher(LaneCapacities::default(), 2);
        let user = UserId::generate();

        for _ in 0..2 {
            let t = task(user, Priority::Low);
            store.insert(&t).await.unwrap();
            dispatcher.enqueue(&t).await.unwrap();
        }

        let third = task(user, Priority::Low);
        store.insert(&third).await.unwrap();
        let err = dispatcher.enqueue(&third).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Capacity {
                reason: CapacityReason::UserLimit { current: 2, limit: 2 }
            }
        ));
        assert_eq!(dispatcher.lane_stats(Priority::Low).size, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admissions_respect_user_limit() {
        let (dispatcher, store) = dispatcher(LaneCapacities::default(), 2);
        let dispatcher = Arc::new(dispatcher);
        let user = UserId::generate();
        dispatcher
            .insert_and_enqueue(&task(user, Priority::Normal))
            .await
            .unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    dispatcher
                        .insert_and_enqueue(&task(user, Priority::Normal))
                        .await
                })
            })
            .collect();

        let mut accepted = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(Error::Capacity {
                    reason: CapacityReason::UserLimit { current: 2, limit: 2 },
                }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((accepted, rejected), (1, 1));
        assert_eq!(store.count_active_for_user(&user, None).await.unwrap(), 2);
        assert_eq!(store.task_count().unwrap(), 2);
        assert_eq!(dispatcher.lane_stats(Priority::Normal).size, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn held_admission_lock_blocks_enqueue() {
        let lock = Arc::new(InMemoryAdvisoryLock::new());
        let (dispatcher, store) = dispatcher(LaneCapacities::default(), 10);
        let dispatcher = dispatcher.with_admission_lock(lock.clone());
        let user = UserId::generate();
        let _held = lock
            .acquire(&admission_lock_key(&user), Duration::from_secs(3600), 1)
            .await
            .unwrap();

        let err = dispatcher
            .insert_and_enqueue(&task(user, Priority::Normal))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConcurrentModification { .. }));
        assert_eq!(store.task_count().unwrap(), 0);
        assert_eq!(dispatcher.lane_stats(Priority::Normal).size, 0);

        // Other users are unaffected.
        dispatcher
            .insert_and_enqueue(&task(UserId::generate(), Priority::Normal))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejected_insert_and_enqueue_removes_task() {
        let capacities = LaneCapacities {
            low: 1,
            normal: 1,
            high: 1,
        };
        let (dispatcher, store) = dispatcher(capacities, 10);
        dispatcher
            .insert_and_enqueue(&task(UserId::generate(), Priority::Low))
            .await
            .unwrap();

        let rejected = task(UserId::generate(), Priority::Low);
        assert!(dispatcher.insert_and_enqueue(&rejected).await.is_err());
        assert!(store.get(&rejected.id).await.unwrap().is_none());
        assert_eq!(store.task_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn estimate_and_ema() {
        let (dispatcher, _) = dispatcher(LaneCapacities::default(), 10);
        assert!((dispatcher.estimate_wait(Priority::High) - 30.0).abs() < 1e-9);

        for _ in 0..5 {
            dispatcher
                .enqueue(&task(UserId::generate(), Priority::High))
                .await
                .unwrap();
        }
        assert!((dispatcher.estimate_wait(Priority::High) - 45.0).abs() < 1e-9);

        dispatcher.record_completion(Priority::High, 130.0);
        let stats = dispatcher.lane_stats(Priority::High);
        assert!((stats.avg_wait_secs - 40.0).abs() < 1e-9);
        assert_eq!(stats.size, 4);
    }

    #[tokio::test]
    async fn decrement_floors_at_zero() {
        let (dispatcher, _) = dispatcher(LaneCapacities::default(), 10);
        dispatcher.release(Priority::Normal);
        dispatcher.record_completion(Priority::Normal, 10.0);
        assert_eq!(dispatcher.lane_stats(Priority::Normal).size, 0);
        assert_eq!(
            dispatcher.lane_sizes().values().copied().collect::<Vec<_>>(),
            vec![0, 0, 0]
        );
    }

    #[tokio::test]
    async fn concurrent_enqueues_never_exceed_capacity() {
        let capacities = LaneCapacities {
            low: 5,
            normal: 5,
            high: 5,
        };
        let (dispatcher, _) = dispatcher(capacities, 1000);
        let dispatcher = Arc::new(dispatcher);

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    dispatcher
                        .enqueue(&task(UserId::generate(), Priority::Normal))
                        .await
                })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 5);
        assert_eq!(dispatcher.lane_stats(Priority::Normal).size, 5);
    }
}
