//! Job queue abstraction for inference workers.
//!
//! This module provides:
//!
//! - [`JobQueue`]: Trait for submitting jobs to an execution backend
//! - [`JobDescriptor`]: Serializable job payload
//! - [`InMemoryJobQueue`](memory::InMemoryJobQueue): In-memory lane queue for testing
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: Same interface for Redis, SQS, local workers
//! - **Idempotent submit**: `job_id` + `attempt` deduplicates resubmissions
//! - **Lane routing**: Options carry the lane channel and a priority weight
//!   the backend's own scheduler honours

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tollgate_core::{ModelId, ModelVersionId, TaskId, UserId};

use crate::error::Result;
use crate::task::{Priority, Task, TaskInput};

/// Job payload delivered to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    /// External job identifier (the task ID).
    pub job_id: String,
    /// Task this job executes.
    pub task_id: TaskId,
    /// Owning user.
    pub user_id: UserId,
    /// Target model.
    pub model_id: ModelId,
    /// Pinned model version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version_id: Option<ModelVersionId>,
    /// Input payload(s).
    pub input: TaskInput,
    /// Lane priority.
    pub priority: Priority,
    /// Delivery attempt (1-indexed).
    pub attempt: u32,
    /// When this attempt was submitted.
    pub enqueued_at: DateTime<Utc>,
}

impl JobDescriptor {
    /// Creates the first-attempt descriptor for a task.
    #[must_use]
    pub fn for_task(task: &Task) -> Self {
        Self {
            job_id: task.id.to_string(),
            task_id: task.id,
            user_id: task.user_id,
            model_id: task.model_id,
            model_version_id: task.model_version_id,
            input: task.input.clone(),
            priority: task.priority,
            attempt: 1,
            enqueued_at: Utc::now(),
        }
    }

    /// Returns the descriptor for the next delivery attempt.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Returns true for batch jobs.
    #[must_use]
    pub const fn is_batch(&self) -> bool {
        self.input.is_batch()
    }

    /// Returns the idempotency key for this job.
    ///
    /// Uses `job_id` + attempt so retries are distinguishable.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}", self.job_id, self.attempt)
    }
}

/// Options for job submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Lane channel name.
    pub lane: String,
    /// Backend scheduling weight (higher runs first).
    pub priority_weight: u8,
    /// Delay before the job becomes visible to workers.
    pub delay: Option<Duration>,
}

impl SubmitOptions {
    /// Creates options routing to the lane for `priority`.
    #[must_use]
    pub fn for_priority(priority: Priority) -> Self {
        Self {
            lane: priority.lane().to_string(),
            priority_weight: priority.weight(),
            delay: None,
        }
    }

    /// Sets the delay before the job becomes visible.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Result of submitting a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    /// Job was submitted.
    Submitted {
        /// Backend message ID.
        message_id: String,
    },
    /// Same job and attempt was already queued.
    Deduplicated {
        /// The existing message ID.
        existing_message_id: String,
    },
}

impl SubmitResult {
    /// Returns true if a new message was created.
    #[must_use]
    pub const fn is_submitted(&self) -> bool {
        matches!(self, Self::Submitted { .. })
    }

    /// Returns the message ID.
    #[must_use]
    pub fn message_id(&self) -> &str {
        match self {
            Self::Submitted { message_id }
            | Self::Deduplicated {
                existing_message_id: message_id,
            } => message_id,
        }
    }
}

/// Progress of a running batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Items processed so far.
    pub current: usize,
    /// Total items.
    pub total: usize,
}

impl JobProgress {
    /// Returns completion as a percentage in `[0, 100]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.current.min(self.total) as f64 / self.total as f64) * 100.0
    }
}

/// A job handed to a worker.
#[derive(Debug, Clone)]
pub struct ReceivedJob {
    /// Backend message ID.
    pub message_id: String,
    /// The job payload.
    pub descriptor: JobDescriptor,
    /// Options used when submitting.
    pub options: SubmitOptions,
}

/// Job queue abstraction.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from the
/// dispatcher and many workers.
///
/// ## Example
///
/// ```rust,ignore
/// use tollgate_flow::dispatch::{JobDescriptor, JobQueue, SubmitOptions};
///
/// async fn submit<Q: JobQueue>(queue: &Q, job: JobDescriptor) -> Result<()> {
///     let options = SubmitOptions::for_priority(job.priority);
///     let result = queue.submit(job, options).await?;
///     println!("submitted {}", result.message_id());
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submits a job.
    async fn submit(&self, job: JobDescriptor, options: SubmitOptions) -> Result<SubmitResult>;

    /// Revokes a job so no worker picks it up. Best-effort.
    ///
    /// Returns true if the job was known to the queue.
    async fn revoke(&self, job_id: &str) -> Result<bool>;

    /// Records progress for a running job.
    async fn report_progress(&self, job_id: &str, progress: JobProgress) -> Result<()>;

    /// Returns the last reported progress for a job.
    async fn progress(&self, job_id: &str) -> Result<Option<JobProgress>>;

    /// Takes the next visible job: highest weight first, FIFO within a weight.
    async fn receive(&self) -> Result<Option<ReceivedJob>>;

    /// Returns the approximate number of queued jobs on a lane.
    async fn lane_depth(&self, lane: &str) -> Result<usize>;

    /// Returns the queue's name or identifier.
    fn queue_name(&self) -> &str;
}
