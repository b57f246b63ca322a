use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::database::custom_types::{ProjectId, TaskId};
use crate::event_publisher::EventPublisher;
use crate::store::Store;
use crate::task::TaskEvent;

/// One registered task type: a deserializable input body paired with an async body, a queue
/// name, and an optional retry ceiling. Grounded on `JobLike`/`AsyncApp.task()`: the same
/// const-generic-ish associated constants, minus the compile-time job name enum `icij_worker`
/// gets from Python decorators.
#[async_trait]
pub trait TaskHandler: Serialize + DeserializeOwned + Sync + Send + 'static {
    const NAME: &'static str;
    const QUEUE_NAME: &'static str = "default";

    /// `None` means retry forever. Mirrors `RegisteredTask.max_retries`; see DESIGN.md's Open
    /// Question decision on why the default is `Some(3)` rather than unbounded.
    const MAX_RETRIES: Option<u32> = Some(3);

    type Error: std::error::Error + Send + Sync + 'static;
    type Context: Clone + Send + Sync + 'static;

    async fn run(&self, ctx: Self::Context, progress: ProgressReporter) -> Result<serde_json::Value, Self::Error>;

    /// Whether this error should trigger a retry rather than a fatal failure, mirroring the
    /// `recover_from` exception tuple `AsyncApp.task()` accepts. Defaults to no retries: an
    /// unrecognized error is presumed fatal.
    fn is_recoverable(_error: &Self::Error) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskRunError {
    #[error("failed to deserialize task inputs: {0}")]
    InvalidInputs(#[from] serde_json::Error),

    #[error("{message}")]
    Failed { message: String, recoverable: bool },
}

impl TaskRunError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TaskRunError::Failed { recoverable: true, .. })
    }
}

type RunTaskFn<Context> = Arc<
    dyn Fn(
            serde_json::Value,
            Context,
            ProgressReporter,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, TaskRunError>> + Send>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub(crate) struct RegisteredTask<Context> {
    pub queue_name: &'static str,
    pub max_retries: Option<u32>,
    pub run: RunTaskFn<Context>,
}

/// The set of task types a worker pool knows how to run, keyed by [`TaskHandler::NAME`].
#[derive(Clone)]
pub struct Registry<Context> {
    pub(crate) tasks: BTreeMap<&'static str, RegisteredTask<Context>>,
}

impl<Context> Default for Registry<Context> {
    fn default() -> Self {
        Self { tasks: BTreeMap::new() }
    }
}

impl<Context> Registry<Context>
where
    Context: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its `NAME`. Fails if that name is already registered; use
    /// [`Registry::register_override`] to replace a prior registration on purpose.
    pub fn register<T>(mut self) -> Result<Self, RegistryError>
    where
        T: TaskHandler<Context = Context>,
    {
        if self.tasks.contains_key(T::NAME) {
            return Err(RegistryError::DuplicateRegistration(T::NAME));
        }
        self.tasks.insert(T::NAME, registered_task::<T>());
        Ok(self)
    }

    /// Register `T` under its `NAME`, replacing any prior registration under that name.
    pub fn register_override<T>(mut self) -> Self
    where
        T: TaskHandler<Context = Context>,
    {
        self.tasks.insert(T::NAME, registered_task::<T>());
        self
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.keys().copied().collect()
    }

    pub fn queue_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tasks.values().map(|t| t.queue_name).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

fn registered_task<T>() -> RegisteredTask<T::Context>
where
    T: TaskHandler,
{
    RegisteredTask {
        queue_name: T::QUEUE_NAME,
        max_retries: T::MAX_RETRIES,
        run: Arc::new(run_task::<T>),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a task type is already registered under the name '{0}'")]
    DuplicateRegistration(&'static str),
}

fn run_task<T>(
    inputs: serde_json::Value,
    ctx: T::Context,
    progress: ProgressReporter,
) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, TaskRunError>> + Send>>
where
    T: TaskHandler,
{
    Box::pin(async move {
        let task: T = serde_json::from_value(inputs)?;
        match task.run(ctx, progress).await {
            Ok(value) => Ok(value),
            Err(err) => Err(TaskRunError::Failed {
                message: err.to_string(),
                recoverable: T::is_recoverable(&err),
            }),
        }
    })
}

/// Handed to a running task body so it can report progress and cooperatively notice
/// cancellation. Grounded on `CheckCancelledProgress`: progress publishes immediately, the
/// cancellation set is refreshed from the store at most once per `refresh_interval`.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    project: ProjectId,
    publisher: Arc<EventPublisher>,
    store: Arc<dyn Store>,
    refresh_interval: Duration,
    cancelled: Arc<Mutex<(Instant, std::collections::HashSet<TaskId>)>>,
}

#[derive(Debug, thiserror::Error)]
#[error("task {0} was cancelled")]
pub struct TaskCancelledError(pub TaskId);

impl ProgressReporter {
    pub(crate) fn new(
        task_id: TaskId,
        project: ProjectId,
        publisher: Arc<EventPublisher>,
        store: Arc<dyn Store>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            task_id,
            project,
            publisher,
            store,
            refresh_interval,
            cancelled: Arc::new(Mutex::new((
                Instant::now() - refresh_interval,
                std::collections::HashSet::new(),
            ))),
        }
    }

    pub async fn set(&self, progress: f64) -> Result<(), TaskCancelledError> {
        let _ = self.publisher.publish(&self.project, self.task_id, TaskEvent::progress(progress)).await;
        self.check_cancelled(false).await
    }

    /// Check whether this task has been cancelled. `force_refresh` always re-reads the store;
    /// otherwise the cached set from the last refresh within `refresh_interval` is reused.
    pub async fn check_cancelled(&self, force_refresh: bool) -> Result<(), TaskCancelledError> {
        let mut cached = self.cancelled.lock().await;
        if force_refresh || cached.0.elapsed() >= self.refresh_interval {
            if let Ok(ids) = self.store.cancelled_task_ids(&self.project).await {
                cached.1 = ids;
            }
            cached.0 = Instant::now();
        }
        if cached.1.contains(&self.task_id) {
            return Err(TaskCancelledError(self.task_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Adder {
        a: u32,
        b: u32,
    }

    #[async_trait]
    impl TaskHandler for Adder {
        const NAME: &'static str = "adder";
        type Error = std::convert::Infallible;
        type Context = ();

        async fn run(&self, _ctx: (), _progress: ProgressReporter) -> Result<serde_json::Value, Self::Error> {
            Ok(serde_json::json!({ "sum": self.a + self.b }))
        }
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct AdderImpostor;

    #[async_trait]
    impl TaskHandler for AdderImpostor {
        const NAME: &'static str = "adder";
        type Error = std::convert::Infallible;
        type Context = ();

        async fn run(&self, _ctx: (), _progress: ProgressReporter) -> Result<serde_json::Value, Self::Error> {
            Ok(serde_json::json!({ "impostor": true }))
        }
    }

    fn dummy_progress() -> ProgressReporter {
        ProgressReporter::new(
            TaskId::new(),
            ProjectId::from("test-project"),
            Arc::new(EventPublisher::new(Arc::new(crate::store::MemoryStore::new()))),
            Arc::new(crate::store::MemoryStore::new()),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn registered_task_dispatches_to_the_right_handler() {
        let registry: Registry<()> = Registry::new().register::<Adder>().unwrap();
        let registered = registry.tasks.get(Adder::NAME).cloned().unwrap();

        let output = (registered.run)(serde_json::json!({"a": 2, "b": 3}), (), dummy_progress())
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!({"sum": 5}));
    }

    #[test]
    fn duplicate_registration_under_the_same_name_is_rejected() {
        let registry: Registry<()> = Registry::new().register::<Adder>().unwrap();
        let err = registry.register::<AdderImpostor>().unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateRegistration("adder")));
    }

    #[test]
    fn register_override_replaces_a_prior_registration() {
        let registry: Registry<()> = Registry::new().register::<Adder>().unwrap();
        let registry = registry.register_override::<AdderImpostor>();
        assert_eq!(registry.tasks.len(), 1);
    }
}
