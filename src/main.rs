use std::time::Duration;

use futures::future::join_all;
use tokio::time::timeout;

use task_forge::app::{Config, State};
use task_forge::migration::MigrationCoordinator;

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let config = match Config::parse_cli_arguments() {
        Ok(c) => c,
        Err(err) => {
            println!("failed to load config: {err}");
            std::process::exit(2);
        }
    };

    let _guard = task_forge::init_tracing(&config);

    task_forge::register_panic_logger();
    task_forge::report_version();

    let state = match State::from_config(&config).await {
        Ok(state) => state,
        Err(err) => {
            tracing::error!("failed to initialize application state: {err}");
            std::process::exit(2);
        }
    };

    if let Err(err) = MigrationCoordinator::new(
        &*state.store(),
        Vec::new(),
        config.migration_timeout(),
        config.migration_throttle(),
    )
    .run(config.project(), config.force_migrations())
    .await
    {
        tracing::error!("migrations failed: {err}");
        std::process::exit(2);
    }

    let (graceful_waiter, shutdown_rx) = task_forge::graceful_shutdown_blocker();

    let worker_pool = task_forge::worker_pool::WorkerPool::new(
        config.project().clone(),
        state.store(),
        (),
        config.n_workers(),
    )
    .poll_interval(config.task_queue_poll_interval())
    .cancelled_refresh_interval(config.cancelled_tasks_refresh_interval())
    .worker_shutdown_timeout(config.worker_shutdown_timeout());

    let worker_handle = {
        let mut shutdown_rx = shutdown_rx.clone();
        worker_pool
            .start(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await
    };

    let http_handle = task_forge::http_server(&config, tracing::Level::INFO, state, shutdown_rx.clone()).await;

    let _ = graceful_waiter.await;

    if timeout(FINAL_SHUTDOWN_TIMEOUT, join_all(vec![worker_handle, http_handle]))
        .await
        .is_err()
    {
        tracing::error!("hit final shutdown timeout. exiting with remaining work in progress");
        std::process::exit(3);
    }
}
