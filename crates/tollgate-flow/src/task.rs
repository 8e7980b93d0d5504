//! Task state and lifecycle management.
//!
//! This module provides:
//! - `TaskStatus`: The state machine for a classification task
//! - `Priority`: Lane selection, scheduling weight and lane naming
//! - `TaskInput`: Single or batch payloads
//! - `Task`: The persisted task record
//!
//! ## State Machine
//!
//! ```text
//!   ┌─────────┐  start   ┌────────────┐ complete ┌───────────┐
//!   │ PENDING │─────────▶│ PROCESSING │─────────▶│ COMPLETED │
//!   └─────────┘          └────────────┘          └───────────┘
//!        │                     │ fail
//!        │ cancel              ▼
//!        │               ┌────────┐
//!        └──────────────▶│ FAILED │
//!                        └────────┘
//! ```

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tollgate_core::{EntryId, ModelId, ModelVersionId, TaskId, UserId};

use crate::error::{Error, Result};

/// Opaque key/value payload carried as task input and output.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created and waiting for a worker.
    #[default]
    Pending,
    /// A worker is executing the task.
    Processing,
    /// Finished with output.
    Completed,
    /// Finished with an error (including user cancellation).
    Failed,
}

impl TaskStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if the task counts against the user's outstanding limit.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Processing | Self::Failed),
            Self::Processing => matches!(target, Self::Completed | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns all valid target states from the current state.
    #[must_use]
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Pending => vec![Self::Processing, Self::Failed],
            Self::Processing => vec![Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => vec![],
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::validation(format!("unknown task status '{other}'"))),
        }
    }
}

/// Priority of a task, selecting its lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Best-effort lane.
    Low,
    /// Default lane.
    #[default]
    Normal,
    /// Expedited lane (billed at a premium).
    High,
}

impl Priority {
    /// All priorities, lowest first.
    pub const ALL: [Self; 3] = [Self::Low, Self::Normal, Self::High];

    /// Numeric weight passed to the job queue's own scheduler.
    #[must_use]
    pub const fn weight(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Normal => 5,
            Self::High => 9,
        }
    }

    /// Name of the lane-specific channel on the job queue.
    #[must_use]
    pub const fn lane(&self) -> &'static str {
        match self {
            Self::Low => "ml_low",
            Self::Normal => "ml_normal",
            Self::High => "ml_high",
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    /// Index into per-lane arrays ordered like [`Priority::ALL`].
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(Error::validation(format!("unknown priority '{other}'"))),
        }
    }
}

/// Input of a task: one payload or a batch of payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "data", rename_all = "snake_case")]
pub enum TaskInput {
    /// A single prediction.
    Single(Payload),
    /// A batch prediction over many items.
    Batch(Vec<Payload>),
}

impl TaskInput {
    /// Returns true for batch input.
    #[must_use]
    pub const fn is_batch(&self) -> bool {
        matches!(self, Self::Batch(_))
    }

    /// Number of billable items.
    #[must_use]
    pub fn item_count(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Batch(items) => items.len(),
        }
    }

    /// Returns the items as a slice (a single input is one item).
    #[must_use]
    pub fn items(&self) -> &[Payload] {
        match self {
            Self::Single(payload) => std::slice::from_ref(payload),
            Self::Batch(items) => items,
        }
    }

    /// Returns a label for metrics and logs.
    #[must_use]
    pub const fn mode_label(&self) -> &'static str {
        match self {
            Self::Single(_) => "single",
            Self::Batch(_) => "batch",
        }
    }
}

/// A classification task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier (also the external job ID).
    pub id: TaskId,
    /// Owning user.
    pub user_id: UserId,
    /// Target model.
    pub model_id: ModelId,
    /// Specific model version, if pinned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version_id: Option<ModelVersionId>,
    /// Current status.
    pub status: TaskStatus,
    /// Input payload(s).
    pub input: TaskInput,
    /// Output payload, set on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Payload>,
    /// Scheduling priority.
    pub priority: Priority,
    /// External job ID, set once enqueued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Charge entry reserving funds for this task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<EntryId>,
    /// Human-readable failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Sandbox tasks run without billing.
    #[serde(default)]
    pub sandbox: bool,
    /// Latest delivery attempt observed by a worker (1-indexed, 0 before the first).
    #[serde(default)]
    pub attempt: u32,
    /// Optimistic concurrency version, bumped on every stored write.
    #[serde(default)]
    pub version: u64,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When a worker picked the task up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Creates a new pending task.
    #[must_use]
    pub fn new(user_id: UserId, model_id: ModelId, input: TaskInput, priority: Priority) -> Self {
        Self {
            id: TaskId::generate(),
            user_id,
            model_id,
            model_version_id: None,
            status: TaskStatus::Pending,
            input,
            output: None,
            priority,
            job_id: None,
            reservation_id: None,
            error_message: None,
            sandbox: false,
            attempt: 0,
            version: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Uses a pre-generated task ID.
    #[must_use]
    pub const fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Pins a model version.
    #[must_use]
    pub const fn with_model_version(mut self, version_id: Option<ModelVersionId>) -> Self {
        self.model_version_id = version_id;
        self
    }

    /// Attaches the reservation paying for this task.
    #[must_use]
    pub const fn with_reservation(mut self, entry_id: EntryId) -> Self {
        self.reservation_id = Some(entry_id);
        self
    }

    /// Marks the task as a sandbox task.
    #[must_use]
    pub const fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Returns true if the task is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the time spent waiting in the queue, once started.
    #[must_use]
    pub fn waiting_time(&self) -> Option<chrono::Duration> {
        self.started_at.map(|started| started - self.created_at)
    }

    /// Returns the time spent executing, once terminal.
    #[must_use]
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }

    /// Transitions to a new status at `now`, updating lifecycle timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the transition is not allowed;
    /// the task is left untouched in that case.
    #[tracing::instrument(
        skip(self),
        fields(task_id = %self.id, from = %self.status, to = %target)
    )]
    pub fn transition_at(&mut self, target: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidState {
                entity: "task",
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        match target {
            TaskStatus::Processing => self.started_at = Some(now),
            TaskStatus::Completed | TaskStatus::Failed => self.completed_at = Some(now),
            TaskStatus::Pending => {}
        }
        self.status = target;
        Ok(())
    }

    /// Transitions to a new status now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the transition is not allowed.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<()> {
        self.transition_at(target, Utc::now())
    }

    /// Marks the task as picked up by a worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is not pending.
    pub fn start(&mut self) -> Result<()> {
        self.transition_to(TaskStatus::Processing)
    }

    /// Marks the task as completed with output.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is not processing.
    pub fn complete(&mut self, output: Payload) -> Result<()> {
        self.transition_to(TaskStatus::Completed)?;
        self.output = Some(output);
        self.error_message = None;
        Ok(())
    }

    /// Marks the task as failed with a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is already terminal.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition_to(TaskStatus::Failed)?;
        self.error_message = Some(message.into());
        self.output = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(text: &str) -> Payload {
        let mut map = Payload::new();
        map.insert("text".into(), serde_json::Value::String(text.into()));
        map
    }

    fn new_task() -> Task {
        Task::new(
            UserId::generate(),
            ModelId::generate(),
            TaskInput::Single(payload("hello")),
            Priority::Normal,
        )
    }

    #[test]
    fn status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Processing.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Completed.valid_transitions().is_empty());
        assert!(TaskStatus::Failed.valid_transitions().is_empty());
    }

    #[test]
    fn valid_transitions_match_can_transition_to() {
        for from in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            for to in from.valid_transitions() {
                assert!(from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn full_lifecycle_sets_timestamps() {
        let mut task = new_task();
        assert!(task.started_at.is_none());

        task.start().unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_none());
        assert!(task.waiting_time().is_some());

        task.complete(payload("label")).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert!(task.processing_time().is_some());
    }

    #[test]
    fn invalid_transition_does_not_mutate() {
        let mut task = new_task();
        task.start().unwrap();
        task.complete(payload("done")).unwrap();
        let snapshot = task.clone();

        let err = task.fail("late failure").unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(task, snapshot);
    }

    #[test]
    fn cancelling_pending_task_fails_it_without_start() {
        let mut task = new_task();
        task.fail("cancelled by user").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_some());
        assert_eq!(task.error_message.as_deref(), Some("cancelled by user"));
    }

    #[test]
    fn priority_lanes_and_weights() {
        assert_eq!(Priority::Low.weight(), 1);
        assert_eq!(Priority::Normal.weight(), 5);
        assert_eq!(Priority::High.weight(), 9);
        assert_eq!(Priority::High.lane(), "ml_high");
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
        for (i, p) in Priority::ALL.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
    }

    #[test]
    fn batch_input_counts_items() {
        let input = TaskInput::Batch(vec![payload("a"), payload("b"), payload("c")]);
        assert!(input.is_batch());
        assert_eq!(input.item_count(), 3);
        assert_eq!(input.items().len(), 3);

        let single = TaskInput::Single(payload("a"));
        assert_eq!(single.items().len(), 1);
    }

    #[test]
    fn task_serializes_with_lowercase_status() {
        let task = new_task();
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["priority"], "normal");
        assert_eq!(json["input"]["mode"], "single");
    }
}
