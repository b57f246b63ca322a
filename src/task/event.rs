use time::OffsetDateTime;

use crate::task::status::{resolve_status, TaskStatus};
use crate::task::Task;

/// A partial update carrying a subset of task fields, merged into stored state by
/// [`resolve_event`]. Mirrors the event shape a worker publishes after each lifecycle step:
/// reservation, progress tick, retry, completion, or failure.
#[derive(Clone, Debug, Default)]
pub struct TaskEvent {
    pub task_type: Option<String>,
    pub status: Option<TaskStatus>,
    pub progress: Option<f64>,
    pub retries: Option<u32>,
    pub error: Option<(String, String)>,
    pub created_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
}

impl TaskEvent {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }
}

/// The fields `resolve_event` decided should actually be written to the stored task. `None`
/// overall means the event was a total no-op (the task was already in a terminal state); `Some`
/// fields within the resolved event that are `None` mean "leave this field as stored".
#[derive(Clone, Debug, Default)]
pub struct ResolvedEvent {
    pub status: Option<TaskStatus>,
    pub progress: Option<f64>,
    pub retries: Option<u32>,
    pub completed_at: Option<OffsetDateTime>,
}

/// Apply the merge rules of the task lifecycle to an incoming event against stored state.
///
/// `task_type` and `created_at` are frozen once the task exists and are never touched here
/// (callers only consult them on first creation). If the stored task is already terminal the
/// whole event resolves to `None`: the caller is still responsible for persisting any carried
/// error, since errors are ground truth independent of whether the status update applied.
pub fn resolve_event(stored: &Task, event: &TaskEvent) -> Option<ResolvedEvent> {
    if stored.status.is_terminal() {
        return None;
    }

    let resolved_status = resolve_status(stored.status, event.status, stored.retries, event.retries);

    let retries = if resolved_status == stored.status && event.status.is_some() {
        // The status resolution rejected the event outright (e.g. a stale duplicate QUEUED on a
        // RUNNING task) -- don't let its retries field leak through either.
        None
    } else {
        event.retries
    };

    let completed_at = if resolved_status.is_terminal() {
        Some(event.completed_at.unwrap_or_else(OffsetDateTime::now_utc))
    } else {
        None
    };

    Some(ResolvedEvent {
        status: (resolved_status != stored.status).then_some(resolved_status),
        progress: event.progress,
        retries,
        completed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::custom_types::{ProjectId, TaskId};

    fn task_with_status(status: TaskStatus) -> Task {
        Task {
            id: TaskId::new(),
            project: ProjectId::from("test-project"),
            task_type: "noop".to_string(),
            status,
            created_at: OffsetDateTime::now_utc(),
            completed_at: None,
            progress: None,
            retries: None,
            inputs: serde_json::Value::Null,
        }
    }

    #[test]
    fn terminal_task_rejects_entire_event() {
        let stored = task_with_status(TaskStatus::Done);
        let event = TaskEvent {
            status: Some(TaskStatus::Running),
            progress: Some(50.0),
            retries: Some(3),
            ..Default::default()
        };

        assert!(resolve_event(&stored, &event).is_none());
    }

    #[test]
    fn progress_passes_through_when_not_terminal() {
        let stored = task_with_status(TaskStatus::Running);
        let event = TaskEvent::progress(42.0);

        let resolved = resolve_event(&stored, &event).expect("non-terminal resolves");
        assert_eq!(resolved.progress, Some(42.0));
        assert!(resolved.status.is_none());
    }

    #[test]
    fn completion_stamps_completed_at() {
        let stored = task_with_status(TaskStatus::Running);
        let event = TaskEvent::status(TaskStatus::Done);

        let resolved = resolve_event(&stored, &event).expect("resolves");
        assert_eq!(resolved.status, Some(TaskStatus::Done));
        assert!(resolved.completed_at.is_some());
    }

    #[test]
    fn retry_sequence_goes_running_queued_running() {
        let mut stored = task_with_status(TaskStatus::Running);

        let retry_event = TaskEvent {
            status: Some(TaskStatus::Queued),
            retries: Some(1),
            ..Default::default()
        };
        let resolved = resolve_event(&stored, &retry_event).expect("retry announcement resolves");
        assert_eq!(resolved.status, Some(TaskStatus::Queued));
        assert_eq!(resolved.retries, Some(1));
        stored.status = resolved.status.unwrap();
        stored.retries = resolved.retries;

        let resume_event = TaskEvent::status(TaskStatus::Running);
        let resolved = resolve_event(&stored, &resume_event).expect("resume resolves");
        assert_eq!(resolved.status, Some(TaskStatus::Running));
    }
}
