mod catch_panic;

use std::sync::Arc;
use std::time::Duration;

use catch_panic::CatchPanicFuture;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::database::custom_types::{ProjectId, TaskId, WorkerId};
use crate::event_publisher::EventPublisher;
use crate::registry::{ProgressReporter, Registry};
use crate::store::{Store, StoreError};
use crate::task::{Task, TaskEvent, TaskResult, TaskStatus};

/// Consumes tasks of the registered types from one project's queue, one at a time. Grounded on
/// `neo4j_app.icij_worker.worker.Worker.work_forever`/`task_wrapper`/`_retry_task`: receive,
/// lock, pre-check cancellation, run with retry, persist outcome, release the lock.
pub struct Worker<Context>
where
    Context: Clone + Send + Sync + 'static,
{
    id: WorkerId,
    project: ProjectId,
    store: Arc<dyn Store>,
    publisher: Arc<EventPublisher>,
    registry: Registry<Context>,
    context: Context,
    poll_interval: Duration,
    cancelled_refresh_interval: Duration,
    shutdown_signal: watch::Receiver<()>,
}

impl<Context> Worker<Context>
where
    Context: Clone + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: WorkerId,
        project: ProjectId,
        store: Arc<dyn Store>,
        publisher: Arc<EventPublisher>,
        registry: Registry<Context>,
        context: Context,
        poll_interval: Duration,
        cancelled_refresh_interval: Duration,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        Self {
            id,
            project,
            store,
            publisher,
            registry,
            context,
            poll_interval,
            cancelled_refresh_interval,
            shutdown_signal,
        }
    }

    /// Run until the shutdown signal fires. Idle periods are bounded polls against the store
    /// rather than a push subscription, matching SPEC_FULL.md's §5 scheduling model.
    pub async fn run_forever(mut self) -> Result<(), WorkerError> {
        let task_names = self.registry.task_names();

        loop {
            if self.shutdown_signal.has_changed().unwrap_or(true) {
                tracing::info!(worker = %self.id, "received shutdown signal, stopping");
                return Ok(());
            }

            let next = self
                .store
                .next_queued(&self.project, &task_names)
                .await
                .map_err(WorkerError::Store)?;

            let Some(task) = next else {
                if tokio::time::timeout(self.poll_interval, self.shutdown_signal.changed())
                    .await
                    .is_ok()
                {
                    tracing::info!(worker = %self.id, "received shutdown signal while idle");
                    return Ok(());
                }
                continue;
            };

            self.run_task(task).await;
        }
    }

    async fn run_task(&self, task: Task) {
        let task_id = task.id;

        if let Err(err) = self.store.acquire_task_lock(&self.project, task_id, &self.id).await {
            match err {
                StoreError::Conflict(_) => {
                    tracing::info!(worker = %self.id, task_id = %task_id, "task already reserved");
                }
                err => tracing::error!(worker = %self.id, task_id = %task_id, "failed to lock task: {err}"),
            }
            return;
        }

        let _ = self
            .publisher
            .publish(
                &self.project,
                task_id,
                TaskEvent {
                    status: Some(TaskStatus::Running),
                    progress: Some(0.0),
                    ..Default::default()
                },
            )
            .await;

        let progress = ProgressReporter::new(
            task_id,
            self.project.clone(),
            self.publisher.clone(),
            self.store.clone(),
            self.cancelled_refresh_interval,
        );

        if progress.check_cancelled(true).await.is_err() {
            tracing::info!(worker = %self.id, task_id = %task_id, "task already cancelled, skipping");
            let _ = self.store.release_task_lock(&self.project, task_id).await;
            return;
        }

        let Some(registered) = self.registry.tasks.get(task.task_type.as_str()).cloned() else {
            tracing::error!(worker = %self.id, task_id = %task_id, task_type = %task.task_type, "unregistered task type");
            self.finish_fatal(task_id, "unregistered task type", format!("no handler registered for '{}'", task.task_type)).await;
            let _ = self.store.release_task_lock(&self.project, task_id).await;
            return;
        };

        let mut retries = task.retries.unwrap_or(0);

        loop {
            if let Some(max) = registered.max_retries {
                if retries > max {
                    self.finish_fatal(
                        task_id,
                        "max retries exceeded",
                        format!("{}(id={}): max retries exceeded > {max}", task.task_type, task_id),
                    )
                    .await;
                    break;
                }
            }

            if retries > 0 {
                let _ = progress.set(0.0).await;
            }

            let run_future = CatchPanicFuture::wrap({
                let context = self.context.clone();
                let inputs = task.inputs.clone();
                let progress = progress.clone();
                let run_fn = registered.run.clone();
                async move { run_fn(inputs, context, progress).await }
            });
            tokio::pin!(run_future);

            let outcome = loop {
                tokio::select! {
                    biased;
                    result = &mut run_future => break Outcome::Ran(result),
                    _ = tokio::time::sleep(self.cancelled_refresh_interval) => {
                        if progress.check_cancelled(true).await.is_err() {
                            break Outcome::Cancelled;
                        }
                    }
                }
            };

            match outcome {
                Outcome::Cancelled => {
                    tracing::info!(worker = %self.id, task_id = %task_id, "task cancelled during execution");
                    break;
                }
                Outcome::Ran(Err(panicked)) => {
                    tracing::error!(worker = %self.id, task_id = %task_id, "task panicked: {panicked}");
                    self.finish_fatal(task_id, "panic", panicked.message().to_string()).await;
                    break;
                }
                Outcome::Ran(Ok(Ok(value))) => {
                    self.finish_success(task_id, value).await;
                    break;
                }
                Outcome::Ran(Ok(Err(run_err))) if run_err.is_recoverable() => {
                    retries += 1;
                    tracing::warn!(worker = %self.id, task_id = %task_id, retries, "recoverable error, retrying: {run_err}");
                    let _ = self
                        .publisher
                        .publish(
                            &self.project,
                            task_id,
                            TaskEvent {
                                status: Some(TaskStatus::Queued),
                                retries: Some(retries),
                                error: Some(("recoverable error".to_string(), run_err.to_string())),
                                ..Default::default()
                            },
                        )
                        .await;
                    let _ = self
                        .publisher
                        .publish(
                            &self.project,
                            task_id,
                            TaskEvent {
                                status: Some(TaskStatus::Running),
                                ..Default::default()
                            },
                        )
                        .await;
                }
                Outcome::Ran(Ok(Err(run_err))) => {
                    self.finish_fatal(task_id, "task failed", run_err.to_string()).await;
                    break;
                }
            }
        }

        let _ = self.store.release_task_lock(&self.project, task_id).await;
    }

    async fn finish_success(&self, task_id: TaskId, value: serde_json::Value) {
        let _ = self
            .store
            .save_result(&self.project, TaskResult::new(task_id, value))
            .await;
        let _ = self
            .publisher
            .publish(
                &self.project,
                task_id,
                TaskEvent {
                    status: Some(TaskStatus::Done),
                    progress: Some(100.0),
                    completed_at: Some(OffsetDateTime::now_utc()),
                    ..Default::default()
                },
            )
            .await;
    }

    async fn finish_fatal(&self, task_id: TaskId, title: &str, detail: String) {
        let _ = self
            .publisher
            .publish(
                &self.project,
                task_id,
                TaskEvent {
                    status: Some(TaskStatus::Error),
                    error: Some((title.to_string(), detail)),
                    completed_at: Some(OffsetDateTime::now_utc()),
                    ..Default::default()
                },
            )
            .await;
    }
}

enum Outcome {
    Ran(Result<Result<serde_json::Value, crate::registry::TaskRunError>, catch_panic::CaughtPanic>),
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}
