pub mod error;
pub mod event;
pub mod result;
pub mod status;

pub use error::TaskError;
pub use event::{resolve_event, ResolvedEvent, TaskEvent};
pub use result::TaskResult;
pub use status::{resolve_status, TaskStatus};

use serde::Serialize;
use time::OffsetDateTime;

use crate::database::custom_types::{ProjectId, TaskId};

/// A unit of work. `task_type` and `created_at` are immutable once set; `status` advances
/// according to [`status::resolve_status`]; `completed_at` is set iff `status` is terminal.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct Task {
    pub id: TaskId,
    pub project: ProjectId,

    pub task_type: String,
    pub status: TaskStatus,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,

    pub progress: Option<f64>,
    pub retries: Option<u32>,

    pub inputs: serde_json::Value,
}

impl Task {
    pub fn new(project: ProjectId, task_type: impl Into<String>, inputs: serde_json::Value) -> Self {
        Self::with_id(TaskId::new(), project, task_type, inputs)
    }

    /// Like [`Task::new`], but with a caller-supplied id rather than a freshly minted one, for
    /// `TaskManager::enqueue`'s optional `task_id` (SPEC_FULL.md §4.2's `job.task_id?`).
    pub fn with_id(id: TaskId, project: ProjectId, task_type: impl Into<String>, inputs: serde_json::Value) -> Self {
        Self {
            id,
            project,
            task_type: task_type.into(),
            status: TaskStatus::Created,
            created_at: OffsetDateTime::now_utc(),
            completed_at: None,
            progress: None,
            retries: None,
            inputs,
        }
    }
}

/// A query filter over a project's tasks.
#[derive(Clone, Debug, Default)]
pub struct TaskFilter {
    pub status: Option<Vec<TaskStatus>>,
    pub task_type: Option<String>,
}
