use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use pico_args::Arguments;

use crate::app::Error;
use crate::database::custom_types::ProjectId;

/// A CLI flag wins when present; otherwise fall back to the matching environment variable.
fn cli_or_env<T: FromStr>(cli: Option<T>, env_key: &str) -> Option<T> {
    cli.or_else(|| std::env::var(env_key).ok().and_then(|v| v.parse().ok()))
}

/// Process-wide tunables, parsed once at startup. Grounded on `app::Config::parse_cli_arguments`
/// for the `pico-args` pattern, extended with the knobs `neo4j_app.core.config.AppConfig` exposes
/// for queueing, polling, and migrations (SPEC_FULL.md §6).
#[derive(Debug, Clone)]
pub struct Config {
    listen_addr: SocketAddr,
    store_url: String,
    project: ProjectId,
    max_queue_size: u64,
    n_workers: usize,
    task_queue_poll_interval: Duration,
    cancelled_tasks_refresh_interval: Duration,
    worker_shutdown_timeout: Duration,
    migration_timeout: Duration,
    migration_throttle: Duration,
    force_migrations: bool,
    log_level: String,
    processes: bool,
}

impl Config {
    pub fn listen_addr(&self) -> &SocketAddr {
        &self.listen_addr
    }

    pub fn store_url(&self) -> &str {
        &self.store_url
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    pub fn max_queue_size(&self) -> u64 {
        self.max_queue_size
    }

    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    pub fn task_queue_poll_interval(&self) -> Duration {
        self.task_queue_poll_interval
    }

    pub fn cancelled_tasks_refresh_interval(&self) -> Duration {
        self.cancelled_tasks_refresh_interval
    }

    pub fn worker_shutdown_timeout(&self) -> Duration {
        self.worker_shutdown_timeout
    }

    pub fn migration_timeout(&self) -> Duration {
        self.migration_timeout
    }

    pub fn migration_throttle(&self) -> Duration {
        self.migration_throttle
    }

    pub fn force_migrations(&self) -> bool {
        self.force_migrations
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Whether the `worker-pool` binary should run workers as separate OS processes rather than
    /// `tokio::task`s within itself (SPEC_FULL.md §4.5). Has no effect on the `task-forge` binary.
    pub fn processes(&self) -> bool {
        self.processes
    }

    /// Each option is a `pico-args` flag, falling back to an environment variable of the same
    /// name (`TASK_FORGE_<FLAG>`), falling back in turn to the default in SPEC_FULL.md §6.
    pub fn parse_cli_arguments() -> Result<Self, Error> {
        let mut args = Arguments::from_env();

        let listen_addr = cli_or_env(args.opt_value_from_str("--listen")?, "TASK_FORGE_LISTEN")
            .unwrap_or(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 3000));

        let store_url = cli_or_env(args.opt_value_from_str("--store-url")?, "TASK_FORGE_STORE_URL")
            .unwrap_or_else(|| "sqlite://tasks.db".to_string());

        let project: String =
            cli_or_env(args.opt_value_from_str("--project")?, "TASK_FORGE_PROJECT")
                .unwrap_or_else(|| "default".to_string());

        let max_queue_size = cli_or_env(args.opt_value_from_str("--max-queue-size")?, "TASK_FORGE_MAX_QUEUE_SIZE")
            .unwrap_or(10_000u64);

        let n_workers =
            cli_or_env(args.opt_value_from_str("--workers")?, "TASK_FORGE_WORKERS").unwrap_or(4usize);

        let task_queue_poll_interval_s: u64 =
            cli_or_env(args.opt_value_from_str("--poll-interval-s")?, "TASK_FORGE_POLL_INTERVAL_S")
                .unwrap_or(1);

        let cancelled_tasks_refresh_interval_s: u64 = cli_or_env(
            args.opt_value_from_str("--cancelled-refresh-interval-s")?,
            "TASK_FORGE_CANCELLED_REFRESH_INTERVAL_S",
        )
        .unwrap_or(2);

        let worker_shutdown_timeout_s: u64 = cli_or_env(
            args.opt_value_from_str("--worker-shutdown-timeout-s")?,
            "TASK_FORGE_WORKER_SHUTDOWN_TIMEOUT_S",
        )
        .unwrap_or(5);

        let migration_timeout_s: u64 = cli_or_env(
            args.opt_value_from_str("--migration-timeout-s")?,
            "TASK_FORGE_MIGRATION_TIMEOUT_S",
        )
        .unwrap_or(300);

        let migration_throttle_s: u64 = cli_or_env(
            args.opt_value_from_str("--migration-throttle-s")?,
            "TASK_FORGE_MIGRATION_THROTTLE_S",
        )
        .unwrap_or(1);

        let force_migrations = args.contains("--force-migrations")
            || std::env::var("TASK_FORGE_FORCE_MIGRATIONS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);

        let log_level = cli_or_env(args.opt_value_from_str("--log-level")?, "TASK_FORGE_LOG_LEVEL")
            .unwrap_or_else(|| "info".to_string());

        let processes = args.contains("--processes")
            || std::env::var("TASK_FORGE_PROCESSES")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);

        Ok(Config {
            listen_addr,
            store_url,
            project: ProjectId::from(project),
            max_queue_size,
            n_workers,
            task_queue_poll_interval: Duration::from_secs(task_queue_poll_interval_s),
            cancelled_tasks_refresh_interval: Duration::from_secs(cancelled_tasks_refresh_interval_s),
            worker_shutdown_timeout: Duration::from_secs(worker_shutdown_timeout_s),
            migration_timeout: Duration::from_secs(migration_timeout_s),
            migration_throttle: Duration::from_secs(migration_throttle_s),
            force_migrations,
            log_level,
            processes,
        })
    }
}
