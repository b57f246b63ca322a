use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRef;

use crate::app::{Config, Error};
use crate::database::custom_types::ProjectId;
use crate::health_check::data_source::{DataSource, DataSourceError, DynDataSource};
use crate::store::{MemoryStore, SqliteStore, Store};
use crate::task_manager::TaskManager;

/// Shared application state handed to every HTTP handler: the store, a `TaskManager` front door
/// over it, and the project this process serves. Grounded on `app::State::from_config`'s
/// `FromRef`-per-field pattern, stripped of the session/auth keys this domain has no use for.
#[derive(Clone)]
pub struct State {
    store: Arc<dyn Store>,
    task_manager: TaskManager,
    project: ProjectId,
}

impl State {
    // not implemented as a From trait so it can be async
    pub async fn from_config(config: &Config) -> Result<Self, Error> {
        let store: Arc<dyn Store> = if let Some(path) = config.store_url().strip_prefix("memory://") {
            let _ = path;
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(SqliteStore::connect(config.store_url()).await?)
        };

        let task_manager = TaskManager::new(store.clone(), config.max_queue_size());

        Ok(Self {
            store,
            task_manager,
            project: config.project().clone(),
        })
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.task_manager
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }
}

impl FromRef<State> for TaskManager {
    fn from_ref(state: &State) -> Self {
        state.task_manager.clone()
    }
}

impl FromRef<State> for DynDataSource {
    fn from_ref(state: &State) -> Self {
        Arc::new(StoreDataSource {
            store: state.store.clone(),
            project: state.project.clone(),
        })
    }
}

struct StoreDataSource {
    store: Arc<dyn Store>,
    project: ProjectId,
}

#[async_trait]
impl DataSource for StoreDataSource {
    async fn is_ready(&self) -> Result<(), DataSourceError> {
        self.store
            .count_queued(&self.project)
            .await
            .map(|_| ())
            .map_err(|_| DataSourceError::DependencyFailure)
    }
}
