//! Task operations exposed to the API layer.
//!
//! Creation order is fixed: validate, check the model, quote, reserve,
//! insert, enqueue. A failure after the reservation unwinds what was done so
//! no orphaned task or reservation is left behind.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use tollgate_core::{EntryId, ModelId, ModelVersionId, TaskId, UserId};

use crate::catalog::ModelCatalog;
use crate::dispatch::JobProgress;
use crate::dispatcher::PriorityDispatcher;
use crate::error::{Error, Result};
use crate::pricing::{CostBreakdown, PricingService};
use crate::reservation::ReservationManager;
use crate::store::TaskPage;
use crate::store::lifecycle::{CANCELLED_BY_USER, TaskLifecycle};
use crate::task::{Payload, Priority, Task, TaskInput, TaskStatus};

/// Default maximum items in a batch request.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// Output strings longer than this are truncated in status views.
const OUTPUT_TRUNCATE_THRESHOLD: usize = 1000;
/// Characters kept from a truncated output string.
const OUTPUT_TRUNCATE_KEEP: usize = 500;
const TRUNCATED_SUFFIX: &str = "... [truncated]";

/// Largest page size for task listings.
pub const MAX_PAGE_SIZE: usize = 100;

/// The authenticated caller, as resolved by the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    /// Caller's user ID.
    pub user_id: UserId,
    /// Admins may read any user's tasks.
    pub is_admin: bool,
}

impl Requester {
    /// A regular user.
    #[must_use]
    pub const fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    /// An administrator.
    #[must_use]
    pub const fn admin(user_id: UserId) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }

    fn can_access(&self, task: &Task) -> bool {
        self.is_admin || task.user_id == self.user_id
    }
}

/// Parameters for a new task.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateTaskRequest {
    /// Owning user.
    pub user_id: UserId,
    /// Target model.
    pub model_id: ModelId,
    /// Pinned version, if any.
    pub model_version_id: Option<ModelVersionId>,
    /// Input payload(s).
    pub input: TaskInput,
    /// Lane priority.
    pub priority: Priority,
    /// Run without billing.
    pub sandbox: bool,
}

impl CreateTaskRequest {
    /// Creates a normal-priority, billed request.
    #[must_use]
    pub const fn new(user_id: UserId, model_id: ModelId, input: TaskInput) -> Self {
        Self {
            user_id,
            model_id,
            model_version_id: None,
            input,
            priority: Priority::Normal,
            sandbox: false,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Pins a model version.
    #[must_use]
    pub const fn with_version(mut self, version_id: ModelVersionId) -> Self {
        self.model_version_id = Some(version_id);
        self
    }

    /// Marks the request as sandboxed.
    #[must_use]
    pub const fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    fn from_task(task: &Task) -> Self {
        Self {
            user_id: task.user_id,
            model_id: task.model_id,
            model_version_id: task.model_version_id,
            input: task.input.clone(),
            priority: task.priority,
            sandbox: task.sandbox,
        }
    }
}

/// A created and enqueued task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedTask {
    /// The stored task.
    pub task: Task,
    /// Quoted cost.
    pub cost: CostBreakdown,
    /// Estimated queue wait in seconds.
    pub estimated_wait_secs: f64,
}

/// Status view of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusView {
    /// The task.
    pub task_id: TaskId,
    /// Current status.
    pub status: TaskStatus,
    /// Output with long strings truncated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Payload>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Last reported batch progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When processing started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Creates, reads, cancels and reruns tasks.
#[derive(Clone)]
pub struct TaskService {
    catalog: Arc<dyn ModelCatalog>,
    pricing: PricingService,
    reservations: ReservationManager,
    lifecycle: TaskLifecycle,
    dispatcher: Arc<PriorityDispatcher>,
    max_batch_size: usize,
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService")
            .field("max_batch_size", &self.max_batch_size)
            .finish_non_exhaustive()
    }
}

impl TaskService {
    /// Creates a task service.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn ModelCatalog>,
        pricing: PricingService,
        reservations: ReservationManager,
        lifecycle: TaskLifecycle,
        dispatcher: Arc<PriorityDispatcher>,
    ) -> Self {
        Self {
            catalog,
            pricing,
            reservations,
            lifecycle,
            dispatcher,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }

    /// Sets the largest accepted batch.
    #[must_use]
    pub const fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Validates, prices, reserves, stores and enqueues a task.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for an empty or oversized input
    /// - [`Error::ModelNotFound`] if the model is missing or inactive
    /// - [`Error::InsufficientFunds`] before any task exists
    /// - [`Error::Capacity`] if the user or lane is at its ceiling
    #[tracing::instrument(
        skip(self, request),
        fields(user_id = %request.user_id, model_id = %request.model_id, priority = %request.priority)
    )]
    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<CreatedTask> {
        self.validate_input(&request.input)?;
        self.catalog
            .require_active(&request.model_id, request.model_version_id.as_ref())
            .await?;
        let cost = self
            .pricing
            .quote(&request.model_id, &request.input, request.priority)
            .await?;

        let mut task = Task::new(
            request.user_id,
            request.model_id,
            request.input,
            request.priority,
        )
        .with_model_version(request.model_version_id)
        .with_sandbox(request.sandbox);

        if !task.sandbox && !cost.is_free() {
            let entry = self
                .reservations
                .reserve(&task.user_id, cost.amount(), &task.id)
                .await?;
            task = task.with_reservation(entry.id);
        }

        let job_id = match self.dispatcher.insert_and_enqueue(&task).await {
            Ok(job_id) => job_id,
            Err(err) => {
                self.abandon_reservation(task.reservation_id, &err).await;
                return Err(err);
            }
        };

        task.job_id = Some(job_id);
        if let Err(err) = self.lifecycle.save(&mut task).await {
            // The job is live and the worker finds the task by ID.
            tracing::warn!(task_id = %task.id, error = %err, "could not record job id");
        }

        let estimated_wait_secs = self.dispatcher.estimate_wait(task.priority);
        tracing::info!(
            task_id = %task.id,
            cost = %cost.discounted_cost,
            estimated_wait_secs,
            "task created"
        );
        Ok(CreatedTask {
            task,
            cost,
            estimated_wait_secs,
        })
    }

    /// Gets a task the requester may see.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::PermissionDenied`].
    pub async fn get_task(&self, task_id: &TaskId, requester: &Requester) -> Result<Task> {
        let task = self.lifecycle.load(task_id).await?;
        if !requester.can_access(&task) {
            return Err(Error::PermissionDenied {
                message: format!("task {task_id} belongs to another user"),
            });
        }
        Ok(task)
    }

    /// Status view with progress and truncated output.
    ///
    /// # Errors
    ///
    /// Same as [`TaskService::get_task`].
    pub async fn task_status(&self, task_id: &TaskId, requester: &Requester) -> Result<TaskStatusView> {
        let task = self.get_task(task_id, requester).await?;
        let progress = match &task.job_id {
            Some(job_id) => self.dispatcher.queue().progress(job_id).await?,
            None => None,
        };
        Ok(TaskStatusView {
            task_id: task.id,
            status: task.status,
            output: task.output.as_ref().map(truncate_output),
            error_message: task.error_message,
            progress,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
        })
    }

    /// Lists the requester's tasks, newest first. `page` is 1-indexed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a zero page or a size outside
    /// `1..=MAX_PAGE_SIZE`.
    pub async fn list_tasks(
        &self,
        requester: &Requester,
        status: Option<TaskStatus>,
        page: usize,
        size: usize,
    ) -> Result<TaskPage> {
        if page == 0 {
            return Err(Error::validation("page must be at least 1"));
        }
        if size == 0 || size > MAX_PAGE_SIZE {
            return Err(Error::validation(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        self.lifecycle
            .store()
            .list_for_user(&requester.user_id, status, (page - 1) * size, size)
            .await
    }

    /// Cancels a pending task, its job and its reservation.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] unless the task is pending
    /// - [`Error::NotFound`] or [`Error::PermissionDenied`]
    #[tracing::instrument(skip(self), fields(%task_id, user_id = %requester.user_id))]
    pub async fn cancel_task(&self, task_id: &TaskId, requester: &Requester) -> Result<Task> {
        let task = self.get_task(task_id, requester).await?;
        if task.status != TaskStatus::Pending {
            return Err(Error::InvalidState {
                entity: "task",
                id: task_id.to_string(),
                from: task.status.to_string(),
                to: "cancelled".into(),
            });
        }

        if let Some(job_id) = &task.job_id {
            match self.dispatcher.queue().revoke(job_id).await {
                Ok(known) => tracing::debug!(%job_id, known, "revoked job"),
                Err(err) => tracing::warn!(%job_id, error = %err, "failed to revoke job"),
            }
        }

        let task = self.lifecycle.cancel(task_id).await?;
        if let Some(entry_id) = task.reservation_id {
            match self.reservations.cancel(&entry_id, CANCELLED_BY_USER).await {
                Ok(_) => {}
                Err(Error::InvalidState { from, .. }) => {
                    tracing::debug!(%entry_id, entry_status = %from, "reservation already resolved");
                }
                Err(err) => tracing::warn!(
                    %entry_id,
                    error = %err,
                    "failed to cancel reservation; leaving it to the reaper"
                ),
            }
        }
        self.dispatcher.release(task.priority);
        tracing::info!("task cancelled");
        Ok(task)
    }

    /// Creates a new task with the parameters of a failed one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the task failed, plus the
    /// errors of [`TaskService::create_task`].
    pub async fn rerun_failed_task(
        &self,
        task_id: &TaskId,
        requester: &Requester,
    ) -> Result<CreatedTask> {
        let original = self.get_task(task_id, requester).await?;
        if original.status != TaskStatus::Failed {
            return Err(Error::InvalidState {
                entity: "task",
                id: task_id.to_string(),
                from: original.status.to_string(),
                to: "rerun".into(),
            });
        }
        let created = self
            .create_task(CreateTaskRequest::from_task(&original))
            .await?;
        tracing::info!(%task_id, new_task_id = %created.task.id, "failed task rerun");
        Ok(created)
    }

    fn validate_input(&self, input: &TaskInput) -> Result<()> {
        match input {
            TaskInput::Single(payload) if payload.is_empty() => {
                Err(Error::validation("input must not be empty"))
            }
            TaskInput::Batch(items) if items.is_empty() => {
                Err(Error::validation("batch must contain at least one item"))
            }
            TaskInput::Batch(items) if items.len() > self.max_batch_size => {
                Err(Error::validation(format!(
                    "batch has {} items, the maximum is {}",
                    items.len(),
                    self.max_batch_size
                )))
            }
            TaskInput::Batch(items) => match items.iter().position(Payload::is_empty) {
                Some(index) => Err(Error::validation(format!("batch item {index} is empty"))),
                None => Ok(()),
            },
            TaskInput::Single(_) => Ok(()),
        }
    }

    async fn abandon_reservation(&self, entry_id: Option<EntryId>, cause: &Error) {
        let Some(entry_id) = entry_id else {
            return;
        };
        if let Err(err) = self
            .reservations
            .rollback(&entry_id, &format!("task not created: {cause}"))
            .await
        {
            tracing::error!(%entry_id, error = %err, "failed to roll back reservation");
        }
    }
}

fn truncate_output(output: &Payload) -> Payload {
    output
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) if s.chars().count() > OUTPUT_TRUNCATE_THRESHOLD => {
                    let mut short: String = s.chars().take(OUTPUT_TRUNCATE_KEEP).collect();
                    short.push_str(TRUNCATED_SUFFIX);
                    Value::String(short)
                }
                other => other.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}
