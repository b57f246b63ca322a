use std::collections::HashMap;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use pico_args::Arguments;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use task_forge::app::{Config, State};
use task_forge::migration::MigrationCoordinator;

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Standalone worker runner, grounded on SPEC_FULL.md §4.5. By default it is the same in-process
/// deployment shape `task-forge` uses for its worker half, minus the HTTP server; with
/// `--processes` it instead supervises `n_workers` copies of itself as separate OS processes, one
/// worker each, for true process isolation.
#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let child_index = child_index_arg();

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

    match child_index {
        Some(index) => run_child(config, index).await,
        None => run_supervisor(config).await,
    }
}

/// `--child-index` is how the supervisor re-execs itself as a single-worker child; it is not a
/// user-facing tunable so it is parsed separately from [`Config::parse_cli_arguments`].
fn child_index_arg() -> Option<usize> {
    Arguments::from_env().opt_value_from_str("--child-index").ok().flatten()
}

/// One worker running as its own OS process. Ignores SIGINT (the supervisor owns the terminal);
/// on SIGTERM it cancels its `work_forever` loop, tears down, and exits 0.
async fn run_child(config: Config, index: usize) {
    let state = match State::from_config(&config).await {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(index, "child worker failed to initialize: {err}");
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
        tracing::error!(index, "migrations failed: {err}");
        std::process::exit(2);
    }

    let (shutdown_waiter, shutdown_rx) = task_forge::child_worker_shutdown_blocker();

    let pool = task_forge::worker_pool::WorkerPool::new(config.project().clone(), state.store(), (), 1)
        .poll_interval(config.task_queue_poll_interval())
        .cancelled_refresh_interval(config.cancelled_tasks_refresh_interval())
        .worker_shutdown_timeout(config.worker_shutdown_timeout());

    let worker_handle = {
        let mut shutdown_rx = shutdown_rx.clone();
        pool.start(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
    };

    let _ = shutdown_waiter.await;
    if timeout(config.worker_shutdown_timeout(), worker_handle).await.is_err() {
        tracing::warn!(index, "worker did not stop within the shutdown timeout, exiting anyway");
    }
    tracing::info!(index, "worker process exiting");
    std::process::exit(0);
}

/// The common deployment shape: workers as `tokio::task`s within this one process, identical to
/// how `task-forge` runs its worker half.
async fn run_in_process_workers(config: Config) {
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

    let pool = task_forge::worker_pool::WorkerPool::new(
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
        pool.start(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
    };

    let _ = graceful_waiter.await;
    if timeout(FINAL_SHUTDOWN_TIMEOUT, worker_handle).await.is_err() {
        tracing::error!("hit final shutdown timeout, exiting with remaining work in progress");
        std::process::exit(3);
    }
}

async fn run_supervisor(config: Config) {
    if !config.processes() {
        run_in_process_workers(config).await;
        return;
    }

    let n_workers = config.n_workers();
    let exe = match std::env::current_exe() {
        Ok(path) => path,
        Err(err) => {
            tracing::error!("could not resolve own executable path: {err}");
            std::process::exit(2);
        }
    };
    let forwarded_args: Vec<String> = std::env::args().skip(1).collect();

    let mut pids: HashMap<usize, u32> = HashMap::new();
    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();

    for index in 0..n_workers {
        let mut command = Command::new(&exe);
        command
            .args(&forwarded_args)
            .arg("--child-index")
            .arg(index.to_string())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(index, "failed to spawn worker process: {err}");
                send_signal(&pids, Signal::SIGTERM);
                std::process::exit(2);
            }
        };

        if let Some(pid) = child.id() {
            pids.insert(index, pid);
        }

        let exit_tx = exit_tx.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exit_tx.send((index, status));
        });
    }
    drop(exit_tx);

    tracing::info!(n_workers, "worker-pool supervisor spawned child processes");

    let (_shutdown_waiter, mut shutdown_rx) = task_forge::graceful_shutdown_blocker();
    let mut remaining = pids.len();
    let mut shutting_down = false;
    let mut abnormal_exit = false;
    let mut force_kill_at: Option<Instant> = None;

    loop {
        let force_kill_sleep = async {
            match force_kill_at {
                Some(deadline) => sleep(deadline.saturating_duration_since(Instant::now())).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = shutdown_rx.changed(), if !shutting_down => {
                tracing::info!("supervisor received shutdown signal, forwarding SIGTERM to workers");
                shutting_down = true;
                send_signal(&pids, Signal::SIGTERM);
                force_kill_at = Some(Instant::now() + config.worker_shutdown_timeout());
            }
            _ = force_kill_sleep, if force_kill_at.is_some() => {
                tracing::warn!("workers did not stop within the shutdown timeout, sending SIGKILL");
                send_signal(&pids, Signal::SIGKILL);
                force_kill_at = None;
            }
            Some((index, status)) = exit_rx.recv() => {
                remaining -= 1;
                pids.remove(&index);
                match status {
                    Ok(status) if status.success() || shutting_down => {
                        tracing::info!(index, "worker process exited");
                    }
                    Ok(status) => {
                        tracing::error!(index, code = ?status.code(), "worker process exited abnormally, tearing down the pool");
                        abnormal_exit = true;
                        shutting_down = true;
                        send_signal(&pids, Signal::SIGTERM);
                        force_kill_at = Some(Instant::now() + config.worker_shutdown_timeout());
                    }
                    Err(err) => {
                        tracing::error!(index, "failed to wait on worker process: {err}");
                        abnormal_exit = true;
                        shutting_down = true;
                        send_signal(&pids, Signal::SIGTERM);
                        force_kill_at = Some(Instant::now() + config.worker_shutdown_timeout());
                    }
                }
                if remaining == 0 {
                    break;
                }
            }
        }
    }

    if abnormal_exit {
        tracing::error!("worker-pool supervisor exiting after an abnormal child exit");
        std::process::exit(1);
    }
    tracing::info!("worker-pool supervisor shut down gracefully");
}

fn send_signal(pids: &HashMap<usize, u32>, sig: Signal) {
    for &pid in pids.values() {
        if let Err(err) = signal::kill(Pid::from_raw(pid as i32), sig) {
            tracing::debug!(pid, "failed to signal worker process (likely already exited): {err}");
        }
    }
}
