//! In-memory task store for testing.
//!
//! This module provides [`InMemoryTaskStore`], a simple in-memory implementation of
//! the [`TaskStore`] trait suitable for testing and development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use tollgate_core::{TaskId, UserId};

use super::{CasResult, TaskPage, TaskStore};
use crate::error::{Error, Result};
use crate::task::{Task, TaskStatus};

/// In-memory task store for testing.
///
/// ## Example
///
/// ```rust
/// use tollgate_flow::store::memory::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// ```
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("task store lock poisoned")
}

impl InMemoryTaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of tasks currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn task_count(&self) -> Result<usize> {
        let count = {
            let tasks = self.tasks.read().map_err(poison_err)?;
            tasks.len()
        };
        Ok(count)
    }
}

fn write_through(slot: &mut Task, task: &Task) -> u64 {
    let version = slot.version + 1;
    *slot = task.clone();
    slot.version = version;
    version
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>> {
        let result = {
            let tasks = self.tasks.read().map_err(poison_err)?;
            tasks.get(task_id).cloned()
        };
        Ok(result)
    }

    async fn insert(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        if tasks.contains_key(&task.id) {
            drop(tasks);
            return Err(Error::validation(format!("task {} already exists", task.id)));
        }
        tasks.insert(task.id, task.clone());
        drop(tasks);
        Ok(())
    }

    async fn update(&self, task: &Task) -> Result<CasResult> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;

        let Some(slot) = tasks.get_mut(&task.id) else {
            drop(tasks);
            return Ok(CasResult::NotFound);
        };
        if slot.status.is_terminal() || slot.status != task.status {
            let actual = slot.status;
            drop(tasks);
            return Ok(CasResult::StateMismatch { actual });
        }
        if slot.version != task.version {
            let actual = slot.version;
            drop(tasks);
            return Ok(CasResult::VersionConflict { actual });
        }

        let version = write_through(slot, task);
        drop(tasks);
        Ok(CasResult::Success { version })
    }

    async fn cas_status(&self, task: &Task, expected: TaskStatus) -> Result<CasResult> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;

        let Some(slot) = tasks.get_mut(&task.id) else {
            drop(tasks);
            return Ok(CasResult::NotFound);
        };
        if slot.status != expected {
            let actual = slot.status;
            drop(tasks);
            return Ok(CasResult::StateMismatch { actual });
        }
        if slot.version != task.version {
            let actual = slot.version;
            drop(tasks);
            return Ok(CasResult::VersionConflict { actual });
        }

        let version = write_through(slot, task);
        drop(tasks);
        Ok(CasResult::Success { version })
    }

    async fn delete(&self, task_id: &TaskId) -> Result<bool> {
        let removed = {
            let mut tasks = self.tasks.write().map_err(poison_err)?;
            tasks.remove(task_id).is_some()
        };
        Ok(removed)
    }

    async fn find_by_job_id(&self, job_id: &str) -> Result<Option<Task>> {
        let result = {
            let tasks = self.tasks.read().map_err(poison_err)?;
            tasks
                .values()
                .find(|t| t.job_id.as_deref() == Some(job_id))
                .cloned()
        };
        Ok(result)
    }

    async fn count_active_for_user(
        &self,
        user_id: &UserId,
        exclude: Option<&TaskId>,
    ) -> Result<usize> {
        let count = {
            let tasks = self.tasks.read().map_err(poison_err)?;
            tasks
                .values()
                .filter(|t| t.user_id == *user_id && t.status.is_active())
                .filter(|t| exclude != Some(&t.id))
                .count()
        };
        Ok(count)
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
        status: Option<TaskStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<TaskPage> {
        let mut matching: Vec<Task> = {
            let tasks = self.tasks.read().map_err(poison_err)?;
            tasks
                .values()
                .filter(|t| t.user_id == *user_id && status.is_none_or(|s| s == t.status))
                .cloned()
                .collect()
        };
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len();
        let tasks = matching.into_iter().skip(offset).take(limit).collect();
        Ok(TaskPage { tasks, total })
    }

    async fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>> {
        let mut matching: Vec<Task> = {
            let tasks = self.tasks.read().map_err(poison_err)?;
            tasks
                .values()
                .filter(|t| t.status == status)
                .cloned()
                .collect()
        };
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        matching.truncate(limit);
        Ok(matching)
    }
}
