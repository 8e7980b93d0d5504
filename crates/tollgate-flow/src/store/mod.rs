//! Pluggable storage for tasks.
//!
//! The [`TaskStore`] trait is the repository contract for task records.
//! [`lifecycle::TaskLifecycle`] layers the state machine on top of it.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: Status changes use compare-and-swap so a worker and a
//!   cancel racing on the same task resolve deterministically
//! - **Optimistic versions**: Field updates carry the version they were read at
//! - **Testability**: In-memory implementation for tests, SQL for production

pub mod lifecycle;
pub mod memory;

use async_trait::async_trait;

use tollgate_core::{TaskId, UserId};

use crate::error::Result;
use crate::task::{Task, TaskStatus};

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// The write was applied.
    Success {
        /// The stored version after the write.
        version: u64,
    },
    /// Task not found.
    NotFound,
    /// Status didn't match the expected value.
    StateMismatch {
        /// The actual status that was found.
        actual: TaskStatus,
    },
    /// Version conflict (concurrent modification).
    VersionConflict {
        /// The actual version that was found.
        actual: u64,
    },
}

impl CasResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Returns true if the task was not found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// One page of a user's tasks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPage {
    /// Tasks on this page, most recent first.
    pub tasks: Vec<Task>,
    /// Total matching tasks across all pages.
    pub total: usize,
}

/// Storage abstraction for tasks.
///
/// ## CAS Semantics
///
/// - [`TaskStore::cas_status`] replaces the record only if its stored status
///   equals `expected` and its stored version equals the version on the passed
///   task. This is the primitive behind every lifecycle transition.
/// - [`TaskStore::update`] replaces the record only if its stored version
///   equals the version on the passed task, and never touches a terminal record.
///
/// Both bump the stored version on success.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Gets a task by ID.
    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>>;

    /// Inserts a new task.
    ///
    /// Fails with a validation error if the ID already exists.
    async fn insert(&self, task: &Task) -> Result<()>;

    /// Replaces a non-terminal task if the stored version matches.
    async fn update(&self, task: &Task) -> Result<CasResult>;

    /// Replaces a task if its stored status matches `expected` and its stored
    /// version matches the passed task's.
    ///
    /// A status mismatch is reported before a version conflict.
    async fn cas_status(&self, task: &Task, expected: TaskStatus) -> Result<CasResult>;

    /// Deletes a task. Returns false if it did not exist.
    async fn delete(&self, task_id: &TaskId) -> Result<bool>;

    /// Finds the task carrying an external job ID.
    async fn find_by_job_id(&self, job_id: &str) -> Result<Option<Task>>;

    /// Counts the user's pending and processing tasks, optionally excluding one.
    async fn count_active_for_user(
        &self,
        user_id: &UserId,
        exclude: Option<&TaskId>,
    ) -> Result<usize>;

    /// Lists a user's tasks, most recent first.
    async fn list_for_user(
        &self,
        user_id: &UserId,
        status: Option<TaskStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<TaskPage>;

    /// Lists tasks in a status, oldest first.
    async fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>>;
}
