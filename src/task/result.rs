use serde::Serialize;

use crate::database::custom_types::TaskId;

/// The value a task produced. At most one per task, written exactly once when the task reaches
/// `Done`.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub result: serde_json::Value,
}

impl TaskResult {
    pub fn new(task_id: TaskId, result: serde_json::Value) -> Self {
        Self { task_id, result }
    }
}
