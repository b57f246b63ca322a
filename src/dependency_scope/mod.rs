use async_trait::async_trait;
use futures::Future;

/// One resource a worker process needs set up before it can run and torn down on the way out
/// (a database pool, a migration run, anything with ordered lifecycle). Grounded on
/// `icij_worker.utils.dependencies.run_deps`'s `(name, enter_fn, exit_fn)` triples.
#[async_trait]
pub trait Dependency: Send + Sync {
    fn name(&self) -> &'static str;

    async fn enter(&self) -> Result<(), DependencyError>;

    /// Best-effort teardown. Errors are logged, not propagated: a failed rollback shouldn't stop
    /// the remaining dependencies from also rolling back, matching `run_deps`'s
    /// `_log_exception_and_continue`.
    async fn exit(&self) {}
}

/// Enters each dependency in order; if any `enter` fails, everything entered so far is rolled
/// back in reverse order before the error is returned. On success, `body` runs and every
/// dependency is rolled back in reverse order afterward regardless of `body`'s outcome.
pub async fn run_deps<F, Fut, T>(deps: Vec<Box<dyn Dependency>>, body: F) -> Result<T, DependencyError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let mut entered: Vec<Box<dyn Dependency>> = Vec::with_capacity(deps.len());

    for dep in deps {
        tracing::debug!(dependency = dep.name(), "entering");
        if let Err(err) = dep.enter().await {
            tracing::error!(dependency = dep.name(), "failed to enter: {err}");
            roll_back(entered).await;
            return Err(err);
        }
        entered.push(dep);
    }

    let result = body().await;
    roll_back(entered).await;
    Ok(result)
}

async fn roll_back(entered: Vec<Box<dyn Dependency>>) {
    for dep in entered.into_iter().rev() {
        tracing::debug!(dependency = dep.name(), "rolling back");
        dep.exit().await;
    }
}

#[derive(Debug, thiserror::Error)]
#[error("dependency {0} failed to initialize: {1}")]
pub struct DependencyError(pub &'static str, pub String);
