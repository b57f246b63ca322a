use serde::{Deserialize, Serialize};

/// A task's position in its lifecycle.
///
/// `Created -> Queued -> Running -> {Done, Error, Cancelled}`, with `Cancelled` able to preempt
/// any non-terminal state. The three terminal variants are mutually exclusive: whichever arrives
/// first wins and the stored status never regresses out of it.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Queued,
    Running,
    Done,
    Error,
    Cancelled,
}

impl TaskStatus {
    /// Position in the forward progression. Terminal states share a rank since ordering among
    /// them is resolved by first-arrival rather than by relative precedence.
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Created => 0,
            TaskStatus::Queued => 1,
            TaskStatus::Running => 2,
            TaskStatus::Done | TaskStatus::Error | TaskStatus::Cancelled => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error | TaskStatus::Cancelled)
    }
}

/// Resolve a status update against the stored status, per the precedence and retry-disambiguation
/// rules. `stored_retries`/`event_retries` are only consulted for the RUNNING + incoming QUEUED
/// special case (a retry announcement vs. a stale duplicate).
pub fn resolve_status(
    stored: TaskStatus,
    event_status: Option<TaskStatus>,
    stored_retries: Option<u32>,
    event_retries: Option<u32>,
) -> TaskStatus {
    let Some(event_status) = event_status else {
        return stored;
    };

    if stored == event_status {
        return stored;
    }

    // Terminal states never leave; errors are still recorded separately by the publisher.
    if stored.is_terminal() {
        return stored;
    }

    // Cancellation preempts any non-terminal status regardless of rank.
    if event_status == TaskStatus::Cancelled {
        return TaskStatus::Cancelled;
    }

    if event_status.rank() < stored.rank() {
        // The one regression we accept: RUNNING observing a QUEUED event means "a retry is
        // starting", but only if it carries a strictly higher retry count than what's stored.
        // Otherwise it's a delayed duplicate of the RUNNING-entry event and is ignored.
        if stored == TaskStatus::Running && event_status == TaskStatus::Queued {
            let stored_n = stored_retries.unwrap_or(0);
            let event_n = event_retries.unwrap_or(0);
            if event_n > stored_n {
                return TaskStatus::Queued;
            }
        }
        return stored;
    }

    event_status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_is_a_no_op() {
        for s in [
            TaskStatus::Created,
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Done,
            TaskStatus::Error,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(resolve_status(s, Some(s), None, None), s);
        }
    }

    #[test]
    fn done_is_done() {
        for event in [
            TaskStatus::Created,
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Error,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(
                resolve_status(TaskStatus::Done, Some(event), None, None),
                TaskStatus::Done
            );
        }
    }

    #[test]
    fn error_stored_ignores_late_queued() {
        assert_eq!(
            resolve_status(TaskStatus::Error, Some(TaskStatus::Queued), None, None),
            TaskStatus::Error
        );
    }

    #[test]
    fn cancel_preempts_any_non_terminal() {
        for stored in [TaskStatus::Created, TaskStatus::Queued, TaskStatus::Running] {
            assert_eq!(
                resolve_status(stored, Some(TaskStatus::Cancelled), None, None),
                TaskStatus::Cancelled
            );
        }
    }

    #[test]
    fn forward_progression() {
        assert_eq!(
            resolve_status(TaskStatus::Created, Some(TaskStatus::Queued), None, None),
            TaskStatus::Queued
        );
        assert_eq!(
            resolve_status(TaskStatus::Queued, Some(TaskStatus::Running), None, None),
            TaskStatus::Running
        );
        assert_eq!(
            resolve_status(TaskStatus::Queued, Some(TaskStatus::Error), None, None),
            TaskStatus::Error
        );
        assert_eq!(
            resolve_status(TaskStatus::Queued, Some(TaskStatus::Done), None, None),
            TaskStatus::Done
        );
    }

    #[test]
    fn late_created_is_ignored_once_queued() {
        assert_eq!(
            resolve_status(TaskStatus::Queued, Some(TaskStatus::Created), None, None),
            TaskStatus::Queued
        );
    }

    /// Mirrors the `test_resolve_running_queued_status` table: the incoming QUEUED event is the
    /// retry signal only when its `retries` strictly exceeds what's stored.
    #[test]
    fn running_queued_retry_disambiguation() {
        let cases: &[(Option<u32>, Option<u32>, TaskStatus)] = &[
            (None, None, TaskStatus::Running),
            (Some(1), None, TaskStatus::Running),
            (Some(2), Some(1), TaskStatus::Running),
            (None, Some(1), TaskStatus::Queued),
            (Some(1), Some(2), TaskStatus::Queued),
        ];

        for (stored_retries, event_retries, expected) in cases.iter().copied() {
            assert_eq!(
                resolve_status(
                    TaskStatus::Running,
                    Some(TaskStatus::Queued),
                    stored_retries,
                    event_retries
                ),
                expected,
                "stored_retries={stored_retries:?} event_retries={event_retries:?}"
            );
        }
    }
}
