use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::database::custom_types::{ProjectId, WorkerId};
use crate::event_publisher::EventPublisher;
use crate::registry::{Registry, TaskHandler};
use crate::store::Store;
use crate::worker::{Worker, WorkerError};

const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder that spins up `n_workers` identical [`Worker`]s sharing one [`Registry`], grounded on
/// `jobs::WorkerPool`: `register_job_type` becomes `register_task_type`, and `start` keeps the
/// same inner shutdown broadcast plus a bounded join-all on the way out.
pub struct WorkerPool<Context>
where
    Context: Clone + Send + Sync + 'static,
{
    project: ProjectId,
    store: Arc<dyn Store>,
    registry: Registry<Context>,
    context: Context,
    n_workers: usize,
    poll_interval: Duration,
    cancelled_refresh_interval: Duration,
    worker_shutdown_timeout: Duration,
}

impl<Context> WorkerPool<Context>
where
    Context: Clone + Send + Sync + 'static,
{
    pub fn new(project: ProjectId, store: Arc<dyn Store>, context: Context, n_workers: usize) -> Self {
        Self {
            project,
            store,
            registry: Registry::new(),
            context,
            n_workers,
            poll_interval: Duration::from_secs(1),
            cancelled_refresh_interval: Duration::from_secs(2),
            worker_shutdown_timeout: WORKER_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn cancelled_refresh_interval(mut self, interval: Duration) -> Self {
        self.cancelled_refresh_interval = interval;
        self
    }

    pub fn worker_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.worker_shutdown_timeout = timeout;
        self
    }

    /// Panics if a task type is already registered under `T::NAME`; use
    /// [`WorkerPool::register_task_type_override`] to replace one on purpose.
    pub fn register_task_type<T>(mut self) -> Self
    where
        T: TaskHandler<Context = Context>,
    {
        self.registry = self
            .registry
            .register::<T>()
            .unwrap_or_else(|err| panic!("{err}"));
        self
    }

    pub fn register_task_type_override<T>(mut self) -> Self
    where
        T: TaskHandler<Context = Context>,
    {
        self.registry = self.registry.register_override::<T>();
        self
    }

    pub async fn start<F>(self, shutdown_signal: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let publisher = Arc::new(EventPublisher::new(self.store.clone()));

        let (inner_shutdown_tx, inner_shutdown_rx) = watch::channel(());
        let worker_shutdown_timeout = self.worker_shutdown_timeout;

        let mut worker_handles = Vec::with_capacity(self.n_workers);
        for idx in 0..self.n_workers {
            let worker_id = WorkerId::new(std::process::id(), idx);
            let worker = Worker::new(
                worker_id.clone(),
                self.project.clone(),
                self.store.clone(),
                publisher.clone(),
                self.registry.clone(),
                self.context.clone(),
                self.poll_interval,
                self.cancelled_refresh_interval,
                inner_shutdown_rx.clone(),
            );

            let handle = tokio::spawn(async move {
                match worker.run_forever().await {
                    Ok(()) => tracing::info!(worker = %worker_id, "worker stopped"),
                    Err(WorkerError::Store(err)) => {
                        tracing::error!(worker = %worker_id, "worker stopped due to store error: {err}")
                    }
                }
            });

            worker_handles.push(handle);
        }

        tokio::spawn(async move {
            shutdown_signal.await;
            tracing::info!("worker pool received shutdown signal");
            let _ = inner_shutdown_tx.send(());

            match timeout(worker_shutdown_timeout, join_all(worker_handles)).await {
                Ok(_) => tracing::info!("worker pool shut down gracefully"),
                Err(_) => tracing::warn!("timed out waiting for workers to stop, abandoning them"),
            }
        })
    }
}
