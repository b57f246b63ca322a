use serde::Serialize;
use time::OffsetDateTime;

use crate::database::custom_types::{TaskErrorId, TaskId};

/// A single failure recorded against a task. Append-only: a task that retries accumulates one
/// `TaskError` per failed attempt.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct TaskError {
    pub id: TaskErrorId,
    pub task_id: TaskId,

    pub title: String,
    pub detail: String,

    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

impl TaskError {
    pub fn new(task_id: TaskId, title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            id: TaskErrorId::new(),
            task_id,
            title: title.into(),
            detail: detail.into(),
            occurred_at: OffsetDateTime::now_utc(),
        }
    }

    /// Ground the title/detail pair the way a caught panic is reported by `CatchPanicFuture`.
    pub fn from_panic(task_id: TaskId, message: impl Into<String>) -> Self {
        Self::new(task_id, "panic", message)
    }
}
