//! Job execution for inference tasks.
//!
//! A [`Worker`] handles one [`JobDescriptor`] at a time: it drives the task
//! through its lifecycle, calls the inference engine and resolves the task's
//! reservation once the outcome is known.
//!
//! ```text
//! job ─▶ find task ─▶ start ─▶ reserve? ─▶ inference ─┬─▶ complete ─▶ settle ─▶ record_completion
//!                                                      ├─▶ retryable ─▶ resubmit(attempt + 1, delay)
//!                                                      └─▶ fail ─▶ rollback ─▶ release
//! ```
//!
//! A job for a task that is already terminal only reconciles the
//! reservation: settled if the task completed, rolled back if it failed.
//! At-least-once delivery therefore never charges twice.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use tollgate_core::{EntryId, TaskId};

use crate::dispatch::{JobDescriptor, JobProgress};
use crate::dispatcher::PriorityDispatcher;
use crate::error::{Error, Result};
use crate::inference::{InferenceEngine, InferenceError};
use crate::metrics::FlowMetrics;
use crate::pricing::PricingService;
use crate::reservation::ReservationManager;
use crate::retry::RetryPolicy;
use crate::store::lifecycle::TaskLifecycle;
use crate::task::{Payload, Task, TaskInput, TaskStatus};

/// Items per batch chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The task completed and its reservation was settled.
    Completed {
        /// The task.
        task_id: TaskId,
    },
    /// The task failed terminally and its reservation was rolled back.
    Failed {
        /// The task.
        task_id: TaskId,
        /// Recorded error message.
        error: String,
    },
    /// The job was resubmitted for another attempt.
    Retrying {
        /// The task.
        task_id: TaskId,
        /// The attempt that was scheduled.
        attempt: u32,
        /// Delay before it becomes visible.
        delay: Duration,
    },
    /// The task was already terminal; its pending reservation was resolved.
    Reconciled {
        /// The task.
        task_id: TaskId,
        /// The task's terminal status.
        status: TaskStatus,
    },
    /// Nothing left to do for this task.
    Skipped {
        /// The task.
        task_id: TaskId,
    },
    /// No task matched the job; inference ran without bookkeeping.
    Untracked {
        /// The job.
        job_id: String,
    },
}

impl JobOutcome {
    /// Returns true if the job was rescheduled.
    #[must_use]
    pub const fn is_retrying(&self) -> bool {
        matches!(self, Self::Retrying { .. })
    }
}

/// Executes inference jobs.
#[derive(Clone)]
pub struct Worker {
    lifecycle: TaskLifecycle,
    reservations: ReservationManager,
    dispatcher: Arc<PriorityDispatcher>,
    pricing: PricingService,
    engine: Arc<dyn InferenceEngine>,
    chunk_size: usize,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Creates a worker.
    #[must_use]
    pub fn new(
        lifecycle: TaskLifecycle,
        reservations: ReservationManager,
        dispatcher: Arc<PriorityDispatcher>,
        pricing: PricingService,
        engine: Arc<dyn InferenceEngine>,
    ) -> Self {
        Self {
            lifecycle,
            reservations,
            dispatcher,
            pricing,
            engine,
            chunk_size: DEFAULT_CHUNK_SIZE,
            metrics: FlowMetrics::new(),
        }
    }

    /// Sets the batch chunk size (at least 1).
    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = if chunk_size == 0 { 1 } else { chunk_size };
        self
    }

    /// Handles one delivery of a job.
    ///
    /// An error that stops the delivery outside the attempt's own failure
    /// handling, such as a storage fault while finding or claiming the task,
    /// is treated like a failed attempt: retryable errors resubmit the job,
    /// and otherwise the task is failed and its reservation rolled back.
    ///
    /// # Errors
    ///
    /// Returns the original error only if the job could be neither
    /// resubmitted nor its task failed. The task then stays unresolved and
    /// only its reservation is released, by the reaper.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.job_id, attempt = job.attempt))]
    pub async fn handle(&self, job: &JobDescriptor) -> Result<JobOutcome> {
        match self.process(job).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => self.recover(job, err).await,
        }
    }

    async fn process(&self, job: &JobDescriptor) -> Result<JobOutcome> {
        let Some(task) = self.find_task(job).await? else {
            return Ok(self.run_untracked(job).await);
        };
        if task.is_terminal() {
            return self.reconcile(&task).await;
        }

        let mut task = match self.lifecycle.start(&task.id, job.attempt).await {
            Ok(task) => task,
            Err(Error::InvalidState { .. }) => {
                let task = self.lifecycle.load(&task.id).await?;
                if task.status == TaskStatus::Processing {
                    tracing::info!(
                        task_id = %task.id,
                        claimed_attempt = task.attempt,
                        "task is running under another delivery; skipping"
                    );
                    return Ok(JobOutcome::Skipped { task_id: task.id });
                }
                return self.reconcile(&task).await;
            }
            Err(err) => return Err(err),
        };

        match self.execute(&mut task, job).await {
            Ok(output) => self.succeed(task, job, output).await,
            Err(err) => self.handle_failure(&task, job, err).await,
        }
    }

    async fn recover(&self, job: &JobDescriptor, err: Error) -> Result<JobOutcome> {
        let policy = RetryPolicy::for_job(job);
        if err.is_retryable() && policy.should_retry(job.attempt) {
            let delay = policy.delay_for(job.attempt);
            match self.dispatcher.resubmit(job, delay).await {
                Ok(next) => {
                    self.metrics
                        .record_retry(job.input.mode_label(), next.attempt);
                    tracing::warn!(
                        task_id = %job.task_id,
                        error = %err,
                        next_attempt = next.attempt,
                        delay_secs = delay.as_secs(),
                        "job interrupted; retrying"
                    );
                    return Ok(JobOutcome::Retrying {
                        task_id: job.task_id,
                        attempt: next.attempt,
                        delay,
                    });
                }
                Err(submit_err) => tracing::error!(
                    task_id = %job.task_id,
                    error = %submit_err,
                    "failed to resubmit interrupted job"
                ),
            }
        }

        let message = err.to_string();
        match self.lifecycle.fail(&job.task_id, &message).await {
            Ok(task) => {
                tracing::error!(
                    task_id = %task.id,
                    error = %message,
                    attempt = job.attempt,
                    "interrupted task failed"
                );
                if let Some(entry_id) = task.reservation_id {
                    self.rollback_quietly(&entry_id, &message).await;
                }
                self.dispatcher.release(task.priority);
                Ok(JobOutcome::Failed {
                    task_id: task.id,
                    error: message,
                })
            }
            Err(fail_err) => {
                tracing::error!(
                    task_id = %job.task_id,
                    error = %err,
                    fail_error = %fail_err,
                    "could not resolve interrupted job"
                );
                Err(err)
            }
        }
    }

    /// Finds the job's task by job ID, falling back to the task ID for a job
    /// delivered before its ID was stored on the task.
    async fn find_task(&self, job: &JobDescriptor) -> Result<Option<Task>> {
        let store = self.lifecycle.store();
        if let Some(task) = store.find_by_job_id(&job.job_id).await? {
            return Ok(Some(task));
        }
        Ok(store
            .get(&job.task_id)
            .await?
            .filter(|task| task.job_id.is_none()))
    }

    async fn execute(&self, task: &mut Task, job: &JobDescriptor) -> Result<Payload> {
        self.ensure_reservation(task).await?;

        let version = task.model_version_id.as_ref();
        match &task.input {
            TaskInput::Single(payload) => Ok(self
                .engine
                .predict(&task.model_id, version, payload)
                .await?),
            TaskInput::Batch(items) => self.run_batch(task, job, items).await,
        }
    }

    /// Checks the task's reservation is still pending, or reserves the
    /// quoted cost if the task has none.
    async fn ensure_reservation(&self, task: &mut Task) -> Result<()> {
        if task.sandbox {
            return Ok(());
        }
        if let Some(entry_id) = task.reservation_id {
            let entry = self.reservations.ledger().entry(&entry_id).await?;
            if !entry.is_pending() {
                return Err(Error::InvalidState {
                    entity: "ledger entry",
                    id: entry_id.to_string(),
                    from: entry.status.to_string(),
                    to: "completed".into(),
                });
            }
            return Ok(());
        }

        let quote = self
            .pricing
            .quote(&task.model_id, &task.input, task.priority)
            .await?;
        if quote.is_free() {
            return Ok(());
        }
        let entry = self
            .reservations
            .reserve(&task.user_id, quote.amount(), &task.id)
            .await?;
        task.reservation_id = Some(entry.id);
        if let Err(err) = self.lifecycle.save(task).await {
            task.reservation_id = None;
            self.rollback_quietly(&entry.id, &err.to_string()).await;
            return Err(err);
        }
        tracing::debug!(task_id = %task.id, entry_id = %entry.id, "worker reserved funds");
        Ok(())
    }

    async fn run_batch(
        &self,
        task: &Task,
        job: &JobDescriptor,
        items: &[Payload],
    ) -> Result<Payload> {
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut first_expected: Option<InferenceError> = None;
        let mut first_unexpected: Option<InferenceError> = None;

        for chunk in items.chunks(self.chunk_size) {
            let outcome = self
                .engine
                .batch_predict(&task.model_id, task.model_version_id.as_ref(), chunk)
                .await
                .and_then(|outputs| {
                    if outputs.len() == chunk.len() {
                        Ok(outputs)
                    } else {
                        Err(InferenceError::failed(format!(
                            "expected {} outputs, got {}",
                            chunk.len(),
                            outputs.len()
                        )))
                    }
                });

            match outcome {
                Ok(outputs) => {
                    succeeded += outputs.len();
                    results.extend(outputs.into_iter().map(Value::Object));
                }
                Err(err) => {
                    tracing::warn!(task_id = %task.id, items = chunk.len(), error = %err, "batch chunk failed");
                    failed += chunk.len();
                    let message = err.to_string();
                    results.extend(chunk.iter().map(|_| json!({ "error": message })));
                    let slot = if err.is_expected() {
                        &mut first_expected
                    } else {
                        &mut first_unexpected
                    };
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                }
            }

            let progress = JobProgress {
                current: results.len(),
                total,
            };
            if let Err(err) = self
                .dispatcher
                .queue()
                .report_progress(&job.job_id, progress)
                .await
            {
                tracing::warn!(task_id = %task.id, error = %err, "failed to report batch progress");
            }
        }

        if succeeded == 0 {
            // Every chunk failed: retryable if any failure was unexpected.
            let err = first_unexpected
                .or(first_expected)
                .unwrap_or_else(|| InferenceError::invalid_input("batch has no items"));
            return Err(err.into());
        }

        let mut output = Payload::new();
        output.insert("results".into(), Value::Array(results));
        output.insert("total".into(), json!(total));
        output.insert("succeeded".into(), json!(succeeded));
        output.insert("failed".into(), json!(failed));
        Ok(output)
    }

    async fn succeed(&self, task: Task, job: &JobDescriptor, output: Payload) -> Result<JobOutcome> {
        let task = match self.lifecycle.complete(&task.id, output).await {
            Ok(task) => task,
            Err(err) => return self.handle_failure(&task, job, err).await,
        };

        if let Some(entry_id) = task.reservation_id {
            match self.reservations.settle(&entry_id).await {
                Ok(_) => {}
                Err(Error::InvalidState { from, .. }) => tracing::warn!(
                    task_id = %task.id,
                    %entry_id,
                    entry_status = %from,
                    "reservation resolved before settlement; task completed unbilled"
                ),
                Err(err) => {
                    tracing::warn!(
                        task_id = %task.id,
                        %entry_id,
                        error = %err,
                        "settlement failed; deferring to redelivery"
                    );
                    let delay = RetryPolicy::for_job(job).delay_for(job.attempt);
                    if let Err(err) = self.dispatcher.resubmit(job, delay).await {
                        tracing::error!(task_id = %task.id, error = %err, "failed to requeue settlement");
                    }
                }
            }
        }

        let waiting = task.waiting_time().map_or(0.0, seconds);
        self.dispatcher.record_completion(task.priority, waiting);
        Ok(JobOutcome::Completed { task_id: task.id })
    }

    async fn handle_failure(
        &self,
        task: &Task,
        job: &JobDescriptor,
        err: Error,
    ) -> Result<JobOutcome> {
        let policy = RetryPolicy::for_job(job);
        if err.is_retryable() && policy.should_retry(job.attempt) {
            let delay = policy.delay_for(job.attempt);
            match self.dispatcher.resubmit(job, delay).await {
                Ok(next) => {
                    self.metrics
                        .record_retry(task.input.mode_label(), next.attempt);
                    tracing::warn!(
                        task_id = %task.id,
                        error = %err,
                        next_attempt = next.attempt,
                        delay_secs = delay.as_secs(),
                        "task attempt failed; retrying"
                    );
                    return Ok(JobOutcome::Retrying {
                        task_id: task.id,
                        attempt: next.attempt,
                        delay,
                    });
                }
                Err(submit_err) => tracing::error!(
                    task_id = %task.id,
                    error = %submit_err,
                    "failed to resubmit job; failing task"
                ),
            }
        }

        let message = err.to_string();
        if err.is_expected() {
            tracing::info!(task_id = %task.id, error = %message, "task rejected");
        } else {
            tracing::error!(task_id = %task.id, error = %message, attempt = job.attempt, "task failed");
        }

        match self.lifecycle.fail(&task.id, &message).await {
            Ok(_) => {}
            Err(Error::InvalidState { .. }) => {
                let current = self.lifecycle.load(&task.id).await?;
                return self.reconcile(&current).await;
            }
            Err(err) => return Err(err),
        }
        if let Some(entry_id) = task.reservation_id {
            self.rollback_quietly(&entry_id, &message).await;
        }
        self.dispatcher.release(task.priority);
        Ok(JobOutcome::Failed {
            task_id: task.id,
            error: message,
        })
    }

    /// Resolves the pending reservation of a terminal task.
    async fn reconcile(&self, task: &Task) -> Result<JobOutcome> {
        let skipped = Ok(JobOutcome::Skipped { task_id: task.id });
        let Some(entry_id) = task.reservation_id else {
            return skipped;
        };
        let entry = self.reservations.ledger().entry(&entry_id).await?;
        if !entry.is_pending() {
            return skipped;
        }

        match task.status {
            TaskStatus::Completed => {
                self.reservations.settle(&entry_id).await?;
            }
            TaskStatus::Failed => {
                let reason = task.error_message.as_deref().unwrap_or("task failed");
                self.reservations.rollback(&entry_id, reason).await?;
            }
            TaskStatus::Pending | TaskStatus::Processing => return skipped,
        }
        tracing::info!(task_id = %task.id, %entry_id, status = %task.status, "reconciled reservation");
        Ok(JobOutcome::Reconciled {
            task_id: task.id,
            status: task.status,
        })
    }

    async fn rollback_quietly(&self, entry_id: &EntryId, reason: &str) {
        match self.reservations.rollback(entry_id, reason).await {
            Ok(_) => {}
            Err(Error::InvalidState { from, .. }) => {
                tracing::debug!(%entry_id, entry_status = %from, "reservation already resolved");
            }
            Err(err) => tracing::warn!(
                %entry_id,
                error = %err,
                "failed to roll back reservation; leaving it to the reaper"
            ),
        }
    }

    async fn run_untracked(&self, job: &JobDescriptor) -> JobOutcome {
        let version = job.model_version_id.as_ref();
        let result = match &job.input {
            TaskInput::Single(payload) => self
                .engine
                .predict(&job.model_id, version, payload)
                .await
                .map(|_| ()),
            TaskInput::Batch(items) => {
                let mut result = Ok(());
                for chunk in items.chunks(self.chunk_size) {
                    result = self
                        .engine
                        .batch_predict(&job.model_id, version, chunk)
                        .await
                        .map(|_| ());
                    if result.is_err() {
                        break;
                    }
                }
                result
            }
        };
        match result {
            Ok(()) => tracing::info!(job_id = %job.job_id, "untracked job ran"),
            Err(err) => tracing::warn!(job_id = %job.job_id, error = %err, "untracked job failed"),
        }
        JobOutcome::Untracked {
            job_id: job.job_id.clone(),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn seconds(duration: chrono::Duration) -> f64 {
    duration.num_milliseconds().max(0) as f64 / 1000.0
}
