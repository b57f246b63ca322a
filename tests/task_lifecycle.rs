use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use task_forge::database::custom_types::{ProjectId, TaskId};
use task_forge::registry::{ProgressReporter, TaskHandler};
use task_forge::store::{MemoryStore, Store};
use task_forge::task::{TaskFilter, TaskStatus};
use task_forge::task_manager::{TaskManager, TaskManagerError};
use task_forge::worker_pool::WorkerPool;

fn project() -> ProjectId {
    ProjectId::from("integration-tests")
}

/// Polls the store until `id` reaches a status matching `predicate` or `timeout_dur` elapses.
async fn wait_for_status(
    store: &MemoryStore,
    id: TaskId,
    predicate: impl Fn(TaskStatus) -> bool,
    timeout_dur: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout_dur;
    loop {
        if let Ok(Some(task)) = store.get_task(&project(), id).await {
            if predicate(task.status) {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Shared across every handler invocation in a [`Harness`] so a handler can remember state
/// between retries, since a fresh `Self` is deserialized from `task.inputs` on every attempt.
#[derive(Default)]
struct SharedState {
    flaky_attempts: AtomicU32,
}

type Ctx = Arc<SharedState>;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Echo {
    value: u32,
}

#[async_trait]
impl TaskHandler for Echo {
    const NAME: &'static str = "echo";
    type Error = std::convert::Infallible;
    type Context = Ctx;

    async fn run(&self, _ctx: Ctx, _progress: ProgressReporter) -> Result<serde_json::Value, Self::Error> {
        Ok(serde_json::json!({ "value": self.value }))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FlakyOnce;

#[derive(Debug, thiserror::Error)]
#[error("transient failure")]
struct FlakyError;

#[async_trait]
impl TaskHandler for FlakyOnce {
    const NAME: &'static str = "flaky_once";
    type Error = FlakyError;
    type Context = Ctx;

    async fn run(&self, ctx: Ctx, _progress: ProgressReporter) -> Result<serde_json::Value, Self::Error> {
        if ctx.flaky_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(FlakyError);
        }
        Ok(serde_json::json!({"recovered": true}))
    }

    fn is_recoverable(_error: &Self::Error) -> bool {
        true
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct AlwaysFails;

#[derive(Debug, thiserror::Error)]
#[error("fatal")]
struct FatalError;

#[async_trait]
impl TaskHandler for AlwaysFails {
    const NAME: &'static str = "always_fails";
    type Error = FatalError;
    type Context = Ctx;

    async fn run(&self, _ctx: Ctx, _progress: ProgressReporter) -> Result<serde_json::Value, Self::Error> {
        Err(FatalError)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Panics;

#[async_trait]
impl TaskHandler for Panics {
    const NAME: &'static str = "panics";
    type Error = std::convert::Infallible;
    type Context = Ctx;

    async fn run(&self, _ctx: Ctx, _progress: ProgressReporter) -> Result<serde_json::Value, Self::Error> {
        panic!("deliberate panic for test coverage");
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Sleeper {
    seconds: u64,
}

#[async_trait]
impl TaskHandler for Sleeper {
    const NAME: &'static str = "sleeper";
    type Error = std::convert::Infallible;
    type Context = Ctx;

    async fn run(&self, _ctx: Ctx, progress: ProgressReporter) -> Result<serde_json::Value, Self::Error> {
        for _ in 0..self.seconds * 20 {
            if progress.check_cancelled(false).await.is_err() {
                return Ok(serde_json::json!({"interrupted": true}));
            }
            sleep(Duration::from_millis(50)).await;
        }
        Ok(serde_json::json!({"slept": true}))
    }
}

struct Harness {
    store: MemoryStore,
    manager: TaskManager,
    shutdown_tx: watch::Sender<()>,
    worker_handle: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn spin_up(max_queue_size: u64) -> Self {
        let store = MemoryStore::new();
        let store_arc: Arc<dyn task_forge::store::Store> = Arc::new(store.clone());
        let manager = TaskManager::new(store_arc.clone(), max_queue_size);

        let ctx: Ctx = Arc::new(SharedState::default());
        let pool = WorkerPool::new(project(), store_arc, ctx, 2)
            .poll_interval(Duration::from_millis(20))
            .cancelled_refresh_interval(Duration::from_millis(20))
            .worker_shutdown_timeout(Duration::from_secs(2))
            .register_task_type::<Echo>()
            .register_task_type::<FlakyOnce>()
            .register_task_type::<AlwaysFails>()
            .register_task_type::<Panics>()
            .register_task_type::<Sleeper>();

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let worker_handle = pool
            .start({
                let mut rx = shutdown_rx;
                async move {
                    let _ = rx.changed().await;
                }
            })
            .await;

        Self { store, manager, shutdown_tx, worker_handle }
    }

    async fn teardown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = timeout(Duration::from_secs(2), self.worker_handle).await;
    }
}

#[tokio::test]
async fn happy_path_runs_to_completion() {
    let harness = Harness::spin_up(100).await;

    let task = harness
        .manager
        .enqueue(&project(), Echo::NAME, serde_json::json!({"value": 7}), None)
        .await
        .expect("enqueue should succeed");

    let done = wait_for_status(&harness.store, task.id, TaskStatus::is_terminal, Duration::from_secs(2)).await;
    assert!(done, "task did not reach a terminal state in time");

    let finished = harness.manager.get_task(&project(), task.id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Done);

    let result = harness.manager.get_task_result(&project(), task.id).await.unwrap();
    assert_eq!(result.result, serde_json::json!({"value": 7}));

    harness.teardown().await;
}

#[tokio::test]
async fn recoverable_error_retries_then_succeeds() {
    let harness = Harness::spin_up(100).await;

    let task = harness
        .manager
        .enqueue(&project(), FlakyOnce::NAME, serde_json::json!({}), None)
        .await
        .unwrap();

    // Watch in the background at a tight interval for the QUEUED hand-off a retry announces,
    // since the worker transitions through it on its way back to RUNNING.
    let store = harness.store.clone();
    let task_id = task.id;
    let watcher = tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        let mut saw_queued = false;
        while tokio::time::Instant::now() < deadline {
            if let Ok(Some(t)) = store.get_task(&project(), task_id).await {
                if t.status == TaskStatus::Queued {
                    saw_queued = true;
                }
                if t.status.is_terminal() {
                    break;
                }
            }
            sleep(Duration::from_millis(1)).await;
        }
        saw_queued
    });

    let done = wait_for_status(&harness.store, task.id, TaskStatus::is_terminal, Duration::from_secs(2)).await;
    assert!(done);

    let saw_queued = watcher.await.unwrap();
    assert!(saw_queued, "retry should observably transition RUNNING -> QUEUED before resuming");

    let finished = harness.manager.get_task(&project(), task.id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Done);
    assert_eq!(finished.retries, Some(1));

    harness.teardown().await;
}

#[tokio::test]
async fn fatal_error_lands_in_error_status_with_a_recorded_error() {
    let harness = Harness::spin_up(100).await;

    let task = harness
        .manager
        .enqueue(&project(), AlwaysFails::NAME, serde_json::json!({}), None)
        .await
        .unwrap();

    let done = wait_for_status(&harness.store, task.id, TaskStatus::is_terminal, Duration::from_secs(2)).await;
    assert!(done);

    let finished = harness.manager.get_task(&project(), task.id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Error);

    let errors = harness.manager.get_task_errors(&project(), task.id).await.unwrap();
    assert!(!errors.is_empty());

    harness.teardown().await;
}

#[tokio::test]
async fn panicking_task_is_isolated_and_recorded_as_an_error() {
    let harness = Harness::spin_up(100).await;

    let task = harness
        .manager
        .enqueue(&project(), Panics::NAME, serde_json::json!({}), None)
        .await
        .unwrap();

    let done = wait_for_status(&harness.store, task.id, TaskStatus::is_terminal, Duration::from_secs(2)).await;
    assert!(done, "worker pool should survive a panicking task");

    let finished = harness.manager.get_task(&project(), task.id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Error);

    // Confirm the worker pool kept running after the panic by enqueueing unrelated work.
    let follow_up = harness
        .manager
        .enqueue(&project(), Echo::NAME, serde_json::json!({"value": 1}), None)
        .await
        .unwrap();
    let follow_up_done =
        wait_for_status(&harness.store, follow_up.id, TaskStatus::is_terminal, Duration::from_secs(2)).await;
    assert!(follow_up_done);

    harness.teardown().await;
}

#[tokio::test]
async fn cancelling_a_long_running_task_interrupts_it() {
    let harness = Harness::spin_up(100).await;

    let task = harness
        .manager
        .enqueue(&project(), Sleeper::NAME, serde_json::json!({"seconds": 30}), None)
        .await
        .unwrap();

    let running = wait_for_status(
        &harness.store,
        task.id,
        |status| status == TaskStatus::Running,
        Duration::from_secs(2),
    )
    .await;
    assert!(running, "task never started running");

    harness.manager.cancel(&project(), task.id).await.unwrap();

    let cancelled = wait_for_status(
        &harness.store,
        task.id,
        |status| status == TaskStatus::Cancelled,
        Duration::from_secs(2),
    )
    .await;
    assert!(cancelled, "task did not observe cancellation in time");

    harness.teardown().await;
}

#[tokio::test]
async fn enqueue_rejects_once_the_queue_is_full() {
    let store = MemoryStore::new();
    let store_arc: Arc<dyn task_forge::store::Store> = Arc::new(store);
    let manager = TaskManager::new(store_arc, 1);

    manager
        .enqueue(&project(), Echo::NAME, serde_json::json!({"value": 1}), None)
        .await
        .expect("first enqueue fits under the limit");

    let err = manager
        .enqueue(&project(), Echo::NAME, serde_json::json!({"value": 2}), None)
        .await
        .expect_err("second enqueue should be rejected once the queue is full");

    assert!(matches!(err, TaskManagerError::QueueFull(1)));
}

#[tokio::test]
async fn enqueue_with_a_colliding_task_id_fails_with_task_already_exists() {
    let store = MemoryStore::new();
    let store_arc: Arc<dyn task_forge::store::Store> = Arc::new(store);
    let manager = TaskManager::new(store_arc, 100);

    let id = TaskId::new();
    manager
        .enqueue(&project(), Echo::NAME, serde_json::json!({"value": 1}), Some(id))
        .await
        .expect("first enqueue with this id should succeed");

    let err = manager
        .enqueue(&project(), Echo::NAME, serde_json::json!({"value": 2}), Some(id))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskManagerError::TaskAlreadyExists(existing) if existing == id));
}

#[tokio::test]
async fn listing_tasks_filters_by_status() {
    let store = MemoryStore::new();
    let store_arc: Arc<dyn task_forge::store::Store> = Arc::new(store);
    let manager = TaskManager::new(store_arc, 100);

    manager.enqueue(&project(), Echo::NAME, serde_json::json!({}), None).await.unwrap();
    manager.enqueue(&project(), Echo::NAME, serde_json::json!({}), None).await.unwrap();

    let filter = TaskFilter {
        status: Some(vec![TaskStatus::Queued]),
        task_type: None,
    };
    let queued = manager.get_tasks(&project(), &filter).await.unwrap();
    assert_eq!(queued.len(), 2);

    let filter = TaskFilter {
        status: Some(vec![TaskStatus::Done]),
        task_type: None,
    };
    let done = manager.get_tasks(&project(), &filter).await.unwrap();
    assert!(done.is_empty());
}
