use std::sync::Arc;

use crate::database::custom_types::{ProjectId, TaskId};
use crate::store::{Store, StoreError};
use crate::task::{resolve_event, TaskError, TaskEvent};

/// Applies worker-emitted [`TaskEvent`]s to stored task state. Grounded on
/// `Neo4jEventPublisher.publish_event`: the status/progress/retries merge happens through
/// `resolve_event`, while a carried error is appended unconditionally since errors are ground
/// truth even against a task that just turned terminal.
#[derive(Clone)]
pub struct EventPublisher {
    store: Arc<dyn Store>,
}

impl EventPublisher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn publish(
        &self,
        project: &ProjectId,
        task_id: TaskId,
        event: TaskEvent,
    ) -> Result<(), EventPublisherError> {
        let stored = self
            .store
            .get_task(project, task_id)
            .await?
            .ok_or(EventPublisherError::UnknownTask(task_id))?;

        if let Some(resolved) = resolve_event(&stored, &event) {
            self.store.apply_resolved_event(project, task_id, &resolved).await?;
        }

        if let Some((title, detail)) = event.error {
            let error = TaskError::new(task_id, title, detail);
            self.store.append_error(project, error).await?;
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventPublisherError {
    #[error("no task with id {0}")]
    UnknownTask(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),
}
