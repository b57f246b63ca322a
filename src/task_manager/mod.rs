use std::sync::Arc;

use crate::database::custom_types::{ProjectId, TaskId};
use crate::store::{Store, StoreError};
use crate::task::{Task, TaskError, TaskFilter, TaskResult, TaskStatus};

/// Front door for task CRUD: enqueue, read, and cancel, independent of whichever worker
/// eventually picks a task up. Grounded on `Neo4JTaskManager`, with the queue-size check and the
/// cancel-forces-terminal behavior kept verbatim.
#[derive(Clone)]
pub struct TaskManager {
    store: Arc<dyn Store>,
    max_queue_size: u64,
}

impl TaskManager {
    pub fn new(store: Arc<dyn Store>, max_queue_size: u64) -> Self {
        Self { store, max_queue_size }
    }

    /// Create a task and move it straight to QUEUED. Rejects once `max_queue_size` QUEUED tasks
    /// are already waiting in the project. `task_id`, if given, lets a caller pick the id instead
    /// of having one minted; a collision fails with [`TaskManagerError::TaskAlreadyExists`]
    /// rather than surfacing the store's generic conflict.
    pub async fn enqueue(
        &self,
        project: &ProjectId,
        task_type: impl Into<String>,
        inputs: serde_json::Value,
        task_id: Option<TaskId>,
    ) -> Result<Task, TaskManagerError> {
        let queued = self.store.count_queued(project).await?;
        if queued >= self.max_queue_size {
            return Err(TaskManagerError::QueueFull(self.max_queue_size));
        }

        let id = task_id.unwrap_or_else(TaskId::new);
        let mut task = Task::with_id(id, project.clone(), task_type, inputs);
        task.status = TaskStatus::Queued;
        self.store.create_task(task.clone()).await.map_err(|err| match err {
            StoreError::Conflict(_) => TaskManagerError::TaskAlreadyExists(id),
            err => TaskManagerError::Store(err),
        })?;
        Ok(task)
    }

    pub async fn get_task(&self, project: &ProjectId, id: TaskId) -> Result<Task, TaskManagerError> {
        self.store
            .get_task(project, id)
            .await?
            .ok_or_else(|| TaskManagerError::UnknownTask(id))
    }

    pub async fn get_tasks(&self, project: &ProjectId, filter: &TaskFilter) -> Result<Vec<Task>, TaskManagerError> {
        Ok(self.store.get_tasks(project, filter).await?)
    }

    pub async fn get_task_errors(&self, project: &ProjectId, id: TaskId) -> Result<Vec<TaskError>, TaskManagerError> {
        Ok(self.store.get_task_errors(project, id).await?)
    }

    pub async fn get_task_result(&self, project: &ProjectId, id: TaskId) -> Result<TaskResult, TaskManagerError> {
        self.store
            .get_task_result(project, id)
            .await?
            .ok_or(TaskManagerError::MissingTaskResult(id))
    }

    /// Force a task to CANCELLED regardless of its current status, mirroring
    /// `Neo4JTaskManager._cancel`'s unconditional label swap. A worker mid-execution discovers
    /// the cancellation on its next `cancelled_task_ids` poll.
    pub async fn cancel(&self, project: &ProjectId, id: TaskId) -> Result<Task, TaskManagerError> {
        let mut task = self.get_task(project, id).await?;
        if task.status.is_terminal() {
            return Ok(task);
        }

        let resolved = crate::task::ResolvedEvent {
            status: Some(TaskStatus::Cancelled),
            progress: None,
            retries: None,
            completed_at: Some(time::OffsetDateTime::now_utc()),
        };
        self.store.apply_resolved_event(project, id, &resolved).await?;
        task.status = TaskStatus::Cancelled;
        Ok(task)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskManagerError {
    #[error("no task with id {0}")]
    UnknownTask(TaskId),

    #[error("no result recorded for task {0}")]
    MissingTaskResult(TaskId),

    #[error("task queue is full ({0} tasks already queued)")]
    QueueFull(u64),

    #[error("task {0} already exists")]
    TaskAlreadyExists(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),
}
