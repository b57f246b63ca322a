use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::database::custom_types::{ProjectId, TaskId, WorkerId};
use crate::migration::{Migration, MigrationStatus};
use crate::store::{Store, StoreError, TaskLock};
use crate::task::{ResolvedEvent, Task, TaskError, TaskFilter, TaskResult, TaskStatus};

/// An in-memory [`Store`], the direct descendant of `jobs::MemoryJobStore`'s
/// `Arc<Mutex<BTreeMap<...>>>` idiom. Used by the unit/integration test suite and as a valid
/// single-process production backend.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<(ProjectId, TaskId), Task>,
    errors: HashMap<(ProjectId, TaskId), Vec<TaskError>>,
    results: HashMap<(ProjectId, TaskId), TaskResult>,
    locks: HashMap<(ProjectId, TaskId), TaskLock>,
    migrations: HashMap<(ProjectId, String), Migration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_task(&self, task: Task) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (task.project.clone(), task.id);
        if inner.tasks.contains_key(&key) {
            return Err(StoreError::Conflict(format!("task {} already exists", task.id)));
        }
        inner.tasks.insert(key, task);
        Ok(())
    }

    async fn count_queued(&self, project: &ProjectId) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| &t.project == project && t.status == TaskStatus::Queued)
            .count() as u64)
    }

    async fn get_task(&self, project: &ProjectId, id: TaskId) -> Result<Option<Task>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.get(&(project.clone(), id)).cloned())
    }

    async fn get_tasks(&self, project: &ProjectId, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| &t.project == project)
            .filter(|t| match &filter.status {
                Some(statuses) => statuses.contains(&t.status),
                None => true,
            })
            .filter(|t| match &filter.task_type {
                Some(ty) => t.task_type.contains(ty.as_str()),
                None => true,
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn get_task_errors(&self, project: &ProjectId, id: TaskId) -> Result<Vec<TaskError>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.errors.get(&(project.clone(), id)).cloned().unwrap_or_default())
    }

    async fn get_task_result(&self, project: &ProjectId, id: TaskId) -> Result<Option<TaskResult>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.results.get(&(project.clone(), id)).cloned())
    }

    async fn save_result(&self, project: &ProjectId, result: TaskResult) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (project.clone(), result.task_id);
        if inner.results.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "result for task {} already exists",
                result.task_id
            )));
        }
        inner.results.insert(key, result);
        Ok(())
    }

    async fn apply_resolved_event(
        &self,
        project: &ProjectId,
        id: TaskId,
        resolved: &ResolvedEvent,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(&(project.clone(), id))
            .ok_or_else(|| StoreError::UnknownTask(id, project.clone()))?;

        if let Some(status) = resolved.status {
            task.status = status;
        }
        if let Some(progress) = resolved.progress {
            task.progress = Some(progress);
        }
        if let Some(retries) = resolved.retries {
            task.retries = Some(retries);
        }
        if let Some(completed_at) = resolved.completed_at {
            task.completed_at = Some(completed_at);
        }

        Ok(())
    }

    async fn append_error(&self, project: &ProjectId, error: TaskError) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.errors.entry((project.clone(), error.task_id)).or_default().push(error);
        Ok(())
    }

    async fn acquire_task_lock(
        &self,
        project: &ProjectId,
        id: TaskId,
        worker: &WorkerId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (project.clone(), id);
        if inner.locks.contains_key(&key) {
            return Err(StoreError::Conflict(format!("task {id} already locked")));
        }
        inner.locks.insert(
            key,
            TaskLock {
                task_id: id,
                worker_id: worker.clone(),
                acquired_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(())
    }

    async fn release_task_lock(&self, project: &ProjectId, id: TaskId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.locks.remove(&(project.clone(), id));
        Ok(())
    }

    async fn cancelled_task_ids(&self, project: &ProjectId) -> Result<HashSet<TaskId>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| &t.project == project && t.status == TaskStatus::Cancelled)
            .map(|t| t.id)
            .collect())
    }

    async fn next_queued(&self, project: &ProjectId, task_types: &[&str]) -> Result<Option<Task>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| &t.project == project && t.status == TaskStatus::Queued)
            .filter(|t| task_types.contains(&t.task_type.as_str()))
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn list_migrations(&self, project: &ProjectId) -> Result<Vec<Migration>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .migrations
            .iter()
            .filter(|((p, _), _)| p == project)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn create_migration(
        &self,
        project: &ProjectId,
        version: &str,
        label: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (project.clone(), version.to_string());
        if inner.migrations.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "migration {version} already has a record for {project}"
            )));
        }
        inner.migrations.insert(
            key,
            Migration {
                project: project.clone(),
                version: version.to_string(),
                label: label.to_string(),
                status: MigrationStatus::InProgress,
                started: OffsetDateTime::now_utc(),
                completed: None,
            },
        );
        Ok(())
    }

    async fn complete_migration(&self, project: &ProjectId, version: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (project.clone(), version.to_string());
        let migration = inner
            .migrations
            .get_mut(&key)
            .ok_or_else(|| StoreError::DataCorruption(format!("missing migration record {version}").into()))?;
        migration.status = MigrationStatus::Done;
        migration.completed = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn delete_all_migrations(&self, project: &ProjectId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.migrations.retain(|(p, _), _| p != project);
        Ok(())
    }
}
