use std::collections::HashSet;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};
use sqlx::Row;
use time::OffsetDateTime;

use crate::database::custom_types::{ProjectId, TaskId, WorkerId};
use crate::migration::{Migration, MigrationStatus};
use crate::store::{is_unique_violation, Store, StoreError, TaskLock};
use crate::task::{ResolvedEvent, Task, TaskError, TaskFilter, TaskResult, TaskStatus};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite realization of [`Store`]. Mirrors `database::sqlite::create_executor`'s connection
/// setup (WAL, statement caching, normal sync) and runs the bundled migrations eagerly on
/// connect rather than deferring readiness, since the migration coordinator above this layer
/// already handles cross-worker races.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|err| StoreError::BackendUnavailable(Box::new(err)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .statement_cache_capacity(250)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|err| StoreError::BackendUnavailable(Box::new(err)))?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|err| StoreError::BackendUnavailable(Box::new(err)))?;

        Ok(Self { pool })
    }
}

fn map_sqlx_err(err: sqlx::Error) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::Conflict(err.to_string())
    } else {
        StoreError::BackendUnavailable(Box::new(err))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_task(&self, task: Task) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tasks (id, project, task_type, status, created_at, completed_at, progress, retries, inputs)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id)
        .bind(task.project.as_ref())
        .bind(&task.task_type)
        .bind(task.status)
        .bind(task.created_at)
        .bind(task.completed_at)
        .bind(task.progress)
        .bind(task.retries.map(|r| r as i64))
        .bind(task.inputs.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    async fn count_queued(&self, project: &ProjectId) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM tasks WHERE project = ? AND status = ?")
            .bind(project.as_ref())
            .bind(TaskStatus::Queued)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        let count: i64 = row.try_get("count").map_err(map_sqlx_err)?;
        Ok(count as u64)
    }

    async fn get_task(&self, project: &ProjectId, id: TaskId) -> Result<Option<Task>, StoreError> {
        sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE project = ? AND id = ?")
            .bind(project.as_ref())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?
            .map(TaskRow::into_task)
            .transpose()
    }

    async fn get_tasks(&self, project: &ProjectId, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE project = ? ORDER BY created_at DESC",
        )
        .bind(project.as_ref())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        rows.into_iter()
            .map(TaskRow::into_task)
            .collect::<Result<Vec<_>, _>>()
            .map(|tasks| {
                tasks
                    .into_iter()
                    .filter(|t| match &filter.status {
                        Some(statuses) => statuses.contains(&t.status),
                        None => true,
                    })
                    .filter(|t| match &filter.task_type {
                        Some(ty) => t.task_type.contains(ty.as_str()),
                        None => true,
                    })
                    .collect()
            })
    }

    async fn get_task_errors(&self, project: &ProjectId, id: TaskId) -> Result<Vec<TaskError>, StoreError> {
        let rows = sqlx::query_as::<_, TaskErrorRow>(
            "SELECT id, task_id, title, detail, occurred_at FROM task_errors
             WHERE project = ? AND task_id = ? ORDER BY occurred_at ASC",
        )
        .bind(project.as_ref())
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows.into_iter().map(TaskErrorRow::into_task_error).collect())
    }

    async fn get_task_result(&self, project: &ProjectId, id: TaskId) -> Result<Option<TaskResult>, StoreError> {
        let row = sqlx::query("SELECT result FROM task_results WHERE project = ? AND task_id = ?")
            .bind(project.as_ref())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        match row {
            None => Ok(None),
            Some(row) => {
                let raw: String = row.try_get("result").map_err(map_sqlx_err)?;
                let result = serde_json::from_str(&raw)
                    .map_err(|err| StoreError::DataCorruption(Box::new(err)))?;
                Ok(Some(TaskResult { task_id: id, result }))
            }
        }
    }

    async fn save_result(&self, project: &ProjectId, result: TaskResult) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO task_results (task_id, project, result) VALUES (?, ?, ?)")
            .bind(result.task_id)
            .bind(project.as_ref())
            .bind(result.result.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        Ok(())
    }

    async fn apply_resolved_event(
        &self,
        project: &ProjectId,
        id: TaskId,
        resolved: &ResolvedEvent,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET
                status = COALESCE(?, status),
                progress = COALESCE(?, progress),
                retries = COALESCE(?, retries),
                completed_at = COALESCE(?, completed_at)
             WHERE project = ? AND id = ?",
        )
        .bind(resolved.status)
        .bind(resolved.progress)
        .bind(resolved.retries.map(|r| r as i64))
        .bind(resolved.completed_at)
        .bind(project.as_ref())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownTask(id, project.clone()));
        }

        Ok(())
    }

    async fn append_error(&self, project: &ProjectId, error: TaskError) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO task_errors (id, task_id, project, title, detail, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(error.id)
        .bind(error.task_id)
        .bind(project.as_ref())
        .bind(&error.title)
        .bind(&error.detail)
        .bind(error.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    async fn acquire_task_lock(
        &self,
        project: &ProjectId,
        id: TaskId,
        worker: &WorkerId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO task_locks (task_id, project, worker_id, acquired_at) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(project.as_ref())
        .bind(worker.to_string())
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    async fn release_task_lock(&self, project: &ProjectId, id: TaskId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM task_locks WHERE project = ? AND task_id = ?")
            .bind(project.as_ref())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        Ok(())
    }

    async fn cancelled_task_ids(&self, project: &ProjectId) -> Result<HashSet<TaskId>, StoreError> {
        let rows = sqlx::query("SELECT id FROM tasks WHERE project = ? AND status = ?")
            .bind(project.as_ref())
            .bind(TaskStatus::Cancelled)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        rows.into_iter()
            .map(|row| row.try_get::<TaskId, _>("id").map_err(map_sqlx_err))
            .collect()
    }

    async fn next_queued(&self, project: &ProjectId, task_types: &[&str]) -> Result<Option<Task>, StoreError> {
        if task_types.is_empty() {
            return Ok(None);
        }

        let placeholders = task_types.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let query = format!(
            "SELECT * FROM tasks WHERE project = ? AND status = ? AND task_type IN ({placeholders})
             ORDER BY created_at ASC, id ASC LIMIT 1"
        );

        let mut built = sqlx::query_as::<_, TaskRow>(&query)
            .bind(project.as_ref())
            .bind(TaskStatus::Queued);
        for task_type in task_types {
            built = built.bind(*task_type);
        }

        built
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?
            .map(TaskRow::into_task)
            .transpose()
    }

    async fn list_migrations(&self, project: &ProjectId) -> Result<Vec<Migration>, StoreError> {
        let rows = sqlx::query_as::<_, MigrationRow>(
            "SELECT project, version, label, status, started, completed FROM migrations WHERE project = ?",
        )
        .bind(project.as_ref())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        rows.into_iter().map(MigrationRow::into_migration).collect()
    }

    async fn create_migration(
        &self,
        project: &ProjectId,
        version: &str,
        label: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO migrations (project, version, label, status, started, completed)
             VALUES (?, ?, ?, 'in_progress', ?, NULL)",
        )
        .bind(project.as_ref())
        .bind(version)
        .bind(label)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    async fn complete_migration(&self, project: &ProjectId, version: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE migrations SET status = 'done', completed = ? WHERE project = ? AND version = ?",
        )
        .bind(OffsetDateTime::now_utc())
        .bind(project.as_ref())
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DataCorruption(
                format!("missing migration record {version}").into(),
            ));
        }

        Ok(())
    }

    async fn delete_all_migrations(&self, project: &ProjectId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM migrations WHERE project = ?")
            .bind(project.as_ref())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: TaskId,
    project: String,
    task_type: String,
    status: TaskStatus,
    created_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
    progress: Option<f64>,
    retries: Option<i64>,
    inputs: String,
}

impl TaskRow {
    fn into_task(self) -> Result<Task, StoreError> {
        let inputs = serde_json::from_str(&self.inputs).map_err(|err| StoreError::DataCorruption(Box::new(err)))?;

        Ok(Task {
            id: self.id,
            project: ProjectId::from(self.project),
            task_type: self.task_type,
            status: self.status,
            created_at: self.created_at,
            completed_at: self.completed_at,
            progress: self.progress,
            retries: self.retries.map(|r| r as u32),
            inputs,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskErrorRow {
    id: crate::database::custom_types::TaskErrorId,
    task_id: TaskId,
    title: String,
    detail: String,
    occurred_at: OffsetDateTime,
}

impl TaskErrorRow {
    fn into_task_error(self) -> TaskError {
        TaskError {
            id: self.id,
            task_id: self.task_id,
            title: self.title,
            detail: self.detail,
            occurred_at: self.occurred_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MigrationRow {
    project: String,
    version: String,
    label: String,
    status: String,
    started: OffsetDateTime,
    completed: Option<OffsetDateTime>,
}

impl MigrationRow {
    fn into_migration(self) -> Result<Migration, StoreError> {
        let status = match self.status.as_str() {
            "in_progress" => MigrationStatus::InProgress,
            "done" => MigrationStatus::Done,
            other => {
                return Err(StoreError::DataCorruption(
                    format!("unknown migration status {other}").into(),
                ))
            }
        };

        Ok(Migration {
            project: ProjectId::from(self.project),
            version: self.version,
            label: self.label,
            status,
            started: self.started,
            completed: self.completed,
        })
    }
}
