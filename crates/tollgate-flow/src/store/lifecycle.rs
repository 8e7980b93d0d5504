//! Task lifecycle transitions over a [`TaskStore`].
//!
//! Each transition reads the task, validates the move on the fresh copy and
//! writes it back with [`TaskStore::cas_status`], which checks both status and
//! version. If another writer got in between, the transition reloads and tries
//! again, so concurrent field updates are never overwritten. A move the fresh
//! copy no longer allows fails with [`Error::InvalidState`].

use std::sync::Arc;

use tollgate_core::TaskId;

use super::{CasResult, TaskStore};
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::task::{Payload, Task, TaskStatus};

/// Message recorded on tasks cancelled by their owner.
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Conflicting writes tolerated before a transition gives up.
const MAX_TRANSITION_ATTEMPTS: u32 = 5;

/// Drives task state transitions with compare-and-swap writes.
#[derive(Clone)]
pub struct TaskLifecycle {
    store: Arc<dyn TaskStore>,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for TaskLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLifecycle").finish_non_exhaustive()
    }
}

impl TaskLifecycle {
    /// Creates a lifecycle over a store.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            metrics: FlowMetrics::new(),
        }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Loads a task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the task does not exist.
    pub async fn load(&self, task_id: &TaskId) -> Result<Task> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| Error::not_found("task", task_id))
    }

    /// Claims a task for delivery `attempt`, moving it to processing.
    ///
    /// A task already processing is resumed only by a later attempt (a
    /// retry), and the claim records that attempt. Another delivery of the
    /// attempt that is running does not get the task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the task is terminal or already
    /// claimed by this or a later attempt.
    pub async fn start(&self, task_id: &TaskId, attempt: u32) -> Result<Task> {
        self.transition(task_id, |t| {
            if t.status == TaskStatus::Processing {
                if attempt <= t.attempt {
                    return Err(Error::InvalidState {
                        entity: "task",
                        id: t.id.to_string(),
                        from: format!("processing attempt {}", t.attempt),
                        to: format!("processing attempt {attempt}"),
                    });
                }
                tracing::debug!(task_id = %t.id, attempt, "resuming processing task");
            } else {
                t.start()?;
            }
            t.attempt = t.attempt.max(attempt);
            Ok(())
        })
        .await
    }

    /// Moves a processing task to completed with output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the task is not processing.
    pub async fn complete(&self, task_id: &TaskId, output: Payload) -> Result<Task> {
        self.transition(task_id, |t| t.complete(output.clone())).await
    }

    /// Moves a pending or processing task to failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the task is already terminal.
    pub async fn fail(&self, task_id: &TaskId, message: &str) -> Result<Task> {
        self.transition(task_id, |t| t.fail(message)).await
    }

    /// Cancels a pending task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the task is pending.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<Task> {
        self.transition(task_id, |t| {
            if t.status != TaskStatus::Pending {
                return Err(Error::InvalidState {
                    entity: "task",
                    id: t.id.to_string(),
                    from: t.status.to_string(),
                    to: "cancelled".into(),
                });
            }
            t.fail(CANCELLED_BY_USER)
        })
        .await
    }

    /// Writes non-status field changes with an optimistic version check.
    ///
    /// On success the passed task carries the new version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the task moved or
    /// [`Error::Storage`] on a version conflict.
    pub async fn save(&self, task: &mut Task) -> Result<()> {
        match self.store.update(task).await? {
            CasResult::Success { version } => {
                task.version = version;
                Ok(())
            }
            CasResult::NotFound => Err(Error::not_found("task", task.id)),
            CasResult::StateMismatch { actual } => Err(Error::InvalidState {
                entity: "task",
                id: task.id.to_string(),
                from: actual.to_string(),
                to: task.status.to_string(),
            }),
            CasResult::VersionConflict { actual } => Err(Error::storage(format!(
                "task {} was modified concurrently (version {} != {actual})",
                task.id, task.version
            ))),
        }
    }

    async fn transition<F>(&self, task_id: &TaskId, apply: F) -> Result<Task>
    where
        F: Fn(&mut Task) -> Result<()>,
    {
        let mut conflicts = 0;
        loop {
            let mut task = self.load(task_id).await?;
            let from = task.status;
            apply(&mut task)?;

            match self.store.cas_status(&task, from).await? {
                CasResult::Success { version } => {
                    task.version = version;
                    self.observe(from, &task);
                    return Ok(task);
                }
                CasResult::NotFound => return Err(Error::not_found("task", task.id)),
                CasResult::StateMismatch { actual } => {
                    tracing::debug!(%task_id, expected = %from, %actual, "task moved during transition; reloading");
                }
                CasResult::VersionConflict { actual } => {
                    tracing::debug!(%task_id, read = task.version, actual, "task changed during transition; reloading");
                }
            }

            conflicts += 1;
            if conflicts >= MAX_TRANSITION_ATTEMPTS {
                return Err(Error::storage(format!(
                    "task {task_id} kept changing during a transition from {from}"
                )));
            }
        }
    }

    fn observe(&self, from: TaskStatus, task: &Task) {
        if from == task.status {
            tracing::info!(task_id = %task.id, attempt = task.attempt, "task attempt claimed");
            return;
        }
        self.metrics
            .record_task_transition(from.as_label(), task.status.as_label());
        if task.status.is_terminal() {
            if let Some(elapsed) = task.processing_time() {
                #[allow(clippy::cast_precision_loss)]
                let secs = elapsed.num_milliseconds() as f64 / 1000.0;
                self.metrics.observe_task_duration(
                    task.input.mode_label(),
                    task.status.as_label(),
                    secs,
                );
            }
        }
        tracing::info!(
            task_id = %task.id,
            from = %from,
            to = %task.status,
            "task transitioned"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tollgate_core::{ModelId, UserId};

    use crate::store::TaskPage;
    use crate::store::memory::InMemoryTaskStore;
    use crate::task::{Priority, TaskInput};

    fn new_task() -> Task {
        Task::new(
            UserId::generate(),
            ModelId::generate(),
            TaskInput::Single(Payload::new()),
            Priority::Normal,
        )
    }

    async fn setup() -> (TaskLifecycle, Task) {
        let lifecycle = TaskLifecycle::new(Arc::new(InMemoryTaskStore::new()));
        let task = new_task();
        lifecycle.store().insert(&task).await.unwrap();
        (lifecycle, task)
    }

    /// Records a job ID on the task just before the first status write.
    #[derive(Default)]
    struct RacingStore {
        inner: InMemoryTaskStore,
        raced: AtomicBool,
    }

    #[async_trait]
    impl TaskStore for RacingStore {
        async fn get(&self, task_id: &TaskId) -> Result<Option<Task>> {
            self.inner.get(task_id).await
        }

        async fn insert(&self, task: &Task) -> Result<()> {
            self.inner.insert(task).await
        }

        async fn update(&self, task: &Task) -> Result<CasResult> {
            self.inner.update(task).await
        }

        async fn cas_status(&self, task: &Task, expected: TaskStatus) -> Result<CasResult> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                let mut current = self.inner.get(&task.id).await?.unwrap();
                current.job_id = Some("job-1".into());
                assert!(self.inner.update(&current).await?.is_success());
            }
            self.inner.cas_status(task, expected).await
        }

        async fn delete(&self, task_id: &TaskId) -> Result<bool> {
            self.inner.delete(task_id).await
        }

        async fn find_by_job_id(&self, job_id: &str) -> Result<Option<Task>> {
            self.inner.find_by_job_id(job_id).await
        }

        async fn count_active_for_user(
            &self,
            user_id: &UserId,
            exclude: Option<&TaskId>,
        ) -> Result<usize> {
            self.inner.count_active_for_user(user_id, exclude).await
        }

        async fn list_for_user(
            &self,
            user_id: &UserId,
            status: Option<TaskStatus>,
            offset: usize,
            limit: usize,
        ) -> Result<TaskPage> {
            self.inner.list_for_user(user_id, status, offset, limit).await
        }

        async fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>> {
            self.inner.list_by_status(status, limit).await
        }
    }

    #[tokio::test]
    async fn start_complete_persists() {
        let (lifecycle, task) = setup().await;

        let started = lifecycle.start(&task.id, 1).await.unwrap();
        assert_eq!(started.status, TaskStatus::Processing);
        assert_eq!(started.attempt, 1);
        assert_eq!(started.version, 1);

        let done = lifecycle.complete(&task.id, Payload::new()).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(lifecycle.load(&task.id).await.unwrap(), done);
    }

    #[tokio::test]
    async fn processing_task_resumes_only_for_later_attempt() {
        let (lifecycle, task) = setup().await;
        lifecycle.start(&task.id, 1).await.unwrap();

        let err = lifecycle.start(&task.id, 1).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        let resumed = lifecycle.start(&task.id, 2).await.unwrap();
        assert_eq!(resumed.status, TaskStatus::Processing);
        assert_eq!(resumed.attempt, 2);
        assert_eq!(resumed.version, 2);

        // The claim is recorded, so a second retry delivery loses.
        assert!(lifecycle.start(&task.id, 2).await.is_err());
    }

    #[tokio::test]
    async fn transition_keeps_concurrent_field_write() {
        let store = Arc::new(RacingStore::default());
        let lifecycle = TaskLifecycle::new(store.clone());
        let task = new_task();
        store.insert(&task).await.unwrap();

        let started = lifecycle.start(&task.id, 1).await.unwrap();
        assert_eq!(started.status, TaskStatus::Processing);
        assert_eq!(started.job_id.as_deref(), Some("job-1"));
        assert_eq!(started.version, 2);

        let stored = lifecycle.load(&task.id).await.unwrap();
        assert_eq!(stored.job_id.as_deref(), Some("job-1"));
    }

    #[tokio::test]
    async fn stale_read_does_not_drop_saved_job_id() {
        let (lifecycle, task) = setup().await;
        let read_by_worker = lifecycle.load(&task.id).await.unwrap();

        let mut recorded = lifecycle.load(&task.id).await.unwrap();
        recorded.job_id = Some("job-1".into());
        lifecycle.save(&mut recorded).await.unwrap();

        let started = lifecycle.start(&read_by_worker.id, 1).await.unwrap();
        assert_eq!(started.job_id.as_deref(), Some("job-1"));
        let failed = lifecycle.fail(&task.id, "boom").await.unwrap();
        assert_eq!(failed.job_id.as_deref(), Some("job-1"));
    }

    #[tokio::test]
    async fn cancel_only_from_pending() {
        let (lifecycle, task) = setup().await;
        lifecycle.start(&task.id, 1).await.unwrap();

        let err = lifecycle.cancel(&task.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(
            lifecycle.load(&task.id).await.unwrap().status,
            TaskStatus::Processing
        );
    }

    #[tokio::test]
    async fn cancel_records_message() {
        let (lifecycle, task) = setup().await;
        let cancelled = lifecycle.cancel(&task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Failed);
        assert_eq!(cancelled.error_message.as_deref(), Some(CANCELLED_BY_USER));
    }

    #[tokio::test]
    async fn terminal_task_cannot_start() {
        let (lifecycle, task) = setup().await;
        lifecycle.fail(&task.id, "boom").await.unwrap();

        let err = lifecycle.start(&task.id, 1).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        let err = lifecycle.complete(&task.id, Payload::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn save_bumps_version() {
        let (lifecycle, task) = setup().await;
        let mut task = lifecycle.load(&task.id).await.unwrap();
        task.job_id = Some("job".into());
        lifecycle.save(&mut task).await.unwrap();
        assert_eq!(task.version, 1);

        let mut stale = task.clone();
        stale.version = 0;
        assert!(lifecycle.save(&mut stale).await.is_err());
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let (lifecycle, _) = setup().await;
        let err = lifecycle.start(&TaskId::generate(), 1).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { resource: "task", .. }));
    }
}
