pub mod memory;
pub mod sqlite;

use std::collections::HashSet;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::database::custom_types::{ProjectId, TaskErrorId, TaskId, WorkerId};
use crate::migration::{Migration, MigrationStatus};
use crate::task::{ResolvedEvent, Task, TaskError, TaskFilter, TaskResult};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Persistence layer realizing the task/error/result/lock/migration node-and-edge model of
/// SPEC_FULL.md §3.1 and §6. Both implementations enforce the same uniqueness constraints: one
/// live lock per task id, one migration record per (project, version).
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Insert a brand-new task (status CREATED, about to be moved to QUEUED by the caller).
    /// Returns [`StoreError::Conflict`] if `task.id` already exists in `task.project`.
    async fn create_task(&self, task: Task) -> Result<(), StoreError>;

    /// Count QUEUED tasks in a project, used by `TaskManager::enqueue` to enforce
    /// `max_queue_size`.
    async fn count_queued(&self, project: &ProjectId) -> Result<u64, StoreError>;

    async fn get_task(&self, project: &ProjectId, id: TaskId) -> Result<Option<Task>, StoreError>;

    async fn get_tasks(&self, project: &ProjectId, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    async fn get_task_errors(&self, project: &ProjectId, id: TaskId) -> Result<Vec<TaskError>, StoreError>;

    async fn get_task_result(&self, project: &ProjectId, id: TaskId) -> Result<Option<TaskResult>, StoreError>;

    async fn save_result(&self, project: &ProjectId, result: TaskResult) -> Result<(), StoreError>;

    /// Apply a [`ResolvedEvent`] to the stored task. `None` fields in `resolved` leave the
    /// corresponding column untouched.
    async fn apply_resolved_event(
        &self,
        project: &ProjectId,
        id: TaskId,
        resolved: &ResolvedEvent,
    ) -> Result<(), StoreError>;

    /// Append a `TaskError` row. Always succeeds independent of the task's current status --
    /// errors are ground truth.
    async fn append_error(&self, project: &ProjectId, error: TaskError) -> Result<(), StoreError>;

    /// Attempt to reserve a task for a worker. The uniqueness constraint on `(project, task_id)`
    /// is the whole mechanism: the first caller to write the lock wins, everyone else observes
    /// [`StoreError::Conflict`].
    async fn acquire_task_lock(
        &self,
        project: &ProjectId,
        id: TaskId,
        worker: &WorkerId,
    ) -> Result<(), StoreError>;

    async fn release_task_lock(&self, project: &ProjectId, id: TaskId) -> Result<(), StoreError>;

    /// Ids of every task in `Cancelled` status for a project, used by the worker's cancellation
    /// poll.
    async fn cancelled_task_ids(&self, project: &ProjectId) -> Result<HashSet<TaskId>, StoreError>;

    /// Pop the next QUEUED task for one of the given task types, earliest `created_at` first.
    /// Returns `None` when nothing is available.
    async fn next_queued(&self, project: &ProjectId, task_types: &[&str]) -> Result<Option<Task>, StoreError>;

    async fn list_migrations(&self, project: &ProjectId) -> Result<Vec<Migration>, StoreError>;

    /// Attempt to acquire the migration lock for `(project, version)`. Fails with
    /// [`StoreError::Conflict`] if another worker already holds it.
    async fn create_migration(
        &self,
        project: &ProjectId,
        version: &str,
        label: &str,
    ) -> Result<(), StoreError>;

    async fn complete_migration(&self, project: &ProjectId, version: &str) -> Result<(), StoreError>;

    async fn delete_all_migrations(&self, project: &ProjectId) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("a uniqueness constraint was violated: {0}")]
    Conflict(String),

    #[error("no task with id {0} in project {1}")]
    UnknownTask(TaskId, ProjectId),

    #[error("detected corruption in the store: {0}")]
    DataCorruption(Box<dyn std::error::Error + Send + Sync>),

    #[error("the store backend is unavailable: {0}")]
    BackendUnavailable(Box<dyn std::error::Error + Send + Sync>),
}

/// A lock record reserving a task to exactly one worker. Kept as a distinct row rather than an
/// atomic task-status transition; see DESIGN.md's Open Question decisions for why.
#[derive(Clone, Debug)]
pub struct TaskLock {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub acquired_at: OffsetDateTime,
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
