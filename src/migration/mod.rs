use std::time::{Duration, Instant};

use time::OffsetDateTime;

use crate::database::custom_types::ProjectId;
use crate::store::{Store, StoreError};

/// One entry in the ordered registry of schema migrations a project must apply.
#[derive(Clone, Debug)]
pub struct MigrationStep {
    pub version: &'static str,
    pub label: &'static str,
    pub run: fn() -> Result<(), MigrationError>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MigrationStatus {
    InProgress,
    Done,
}

/// A persisted migration record, mirroring `icij_common.neo4j.migrate.Neo4jMigration`.
#[derive(Clone, Debug)]
pub struct Migration {
    pub project: ProjectId,
    pub version: String,
    pub label: String,
    pub status: MigrationStatus,
    pub started: OffsetDateTime,
    pub completed: Option<OffsetDateTime>,
}

/// Runs the ordered migration registry against one project, serializing concurrent attempts
/// through the store's `(project, version)` uniqueness constraint.
///
/// Grounded step for step on `icij_common.neo4j.migrate.migrate_project_db_schema`: read all
/// records, bail if more than one is IN_PROGRESS, otherwise try to acquire the next un-DONE
/// version; on a constraint conflict back off and retry; give up after `timeout`.
pub struct MigrationCoordinator<'a> {
    store: &'a dyn Store,
    registry: Vec<MigrationStep>,
    timeout: Duration,
    throttle: Duration,
}

impl<'a> MigrationCoordinator<'a> {
    pub fn new(store: &'a dyn Store, registry: Vec<MigrationStep>, timeout: Duration, throttle: Duration) -> Self {
        Self {
            store,
            registry,
            timeout,
            throttle,
        }
    }

    pub async fn run(&self, project: &ProjectId, force: bool) -> Result<(), MigrationError> {
        if force {
            self.store
                .delete_all_migrations(project)
                .await
                .map_err(MigrationError::Store)?;
        }

        let mut sorted = self.registry.clone();
        sorted.sort_by_key(|m| {
            parse_version(m.version).unwrap_or_else(|err| panic!("migration step {}: {err}", m.version))
        });

        let deadline = Instant::now() + self.timeout;

        loop {
            let records = self.store.list_migrations(project).await.map_err(MigrationError::Store)?;

            let in_progress: Vec<_> = records
                .iter()
                .filter(|m| m.status == MigrationStatus::InProgress)
                .collect();

            if in_progress.len() > 1 {
                return Err(MigrationError::InconsistentState {
                    project: project.clone(),
                    in_progress: in_progress.len(),
                });
            }

            if in_progress.len() == 1 {
                if Instant::now() >= deadline {
                    return Err(MigrationError::Timeout(project.clone()));
                }
                tokio::time::sleep(self.throttle).await;
                continue;
            }

            let current_version = records
                .iter()
                .filter(|m| m.status == MigrationStatus::Done)
                .map(|m| parse_version(&m.version))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .max();

            let pending: Vec<_> = sorted
                .iter()
                .filter(|m| {
                    let parsed = parse_version(m.version).unwrap_or_else(|err| panic!("migration step {}: {err}", m.version));
                    current_version.map_or(true, |cur| parsed > cur)
                })
                .collect();

            let Some(next) = pending.first() else {
                tracing::info!(project = %project, "all migrations applied");
                return Ok(());
            };

            match self.store.create_migration(project, next.version, next.label).await {
                Ok(()) => {
                    tracing::info!(project = %project, version = next.version, "running migration");
                    (next.run)()?;
                    self.store
                        .complete_migration(project, next.version)
                        .await
                        .map_err(MigrationError::Store)?;
                }
                Err(StoreError::Conflict(_)) => {
                    tracing::warn!(project = %project, version = next.version, "another worker is migrating, backing off");
                    if Instant::now() >= deadline {
                        return Err(MigrationError::Timeout(project.clone()));
                    }
                    tokio::time::sleep(self.throttle).await;
                }
                Err(err) => return Err(MigrationError::Store(err)),
            }

            if Instant::now() >= deadline {
                return Err(MigrationError::Timeout(project.clone()));
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("migration timed out for project {0}")]
    Timeout(ProjectId),

    #[error("project {project} has {in_progress} migrations in progress, expected at most one")]
    InconsistentState { project: ProjectId, in_progress: usize },

    #[error("migration function failed: {0}")]
    Failed(String),

    #[error("store error during migration: {0}")]
    Store(#[from] StoreError),

    #[error("invalid migration version '{0}', expected a dotted triple like '1.2.0'")]
    InvalidVersion(String),
}

/// Parses a dotted-triple version (optionally `v`-prefixed) into a totally-ordered tuple so
/// versions compare numerically rather than lexicographically -- "0.10.0" must sort after
/// "0.2.0".
fn parse_version(version: &str) -> Result<(u32, u32, u32), MigrationError> {
    let stripped = version.strip_prefix('v').unwrap_or(version);
    let mut parts = stripped.split('.');

    let invalid = || MigrationError::InvalidVersion(version.to_string());
    let major: u32 = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
    let minor: u32 = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
    let patch: u32 = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
    if parts.next().is_some() {
        return Err(invalid());
    }

    Ok((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn versions_compare_numerically_not_lexicographically() {
        assert!(parse_version("0.10.0").unwrap() > parse_version("0.2.0").unwrap());
        assert!(parse_version("1.0.0").unwrap() > parse_version("0.99.99").unwrap());
        assert!(parse_version("v1.2.3").unwrap() == parse_version("1.2.3").unwrap());
    }

    #[test]
    fn malformed_version_is_rejected() {
        assert!(parse_version("1.2").is_err());
        assert!(parse_version("1.2.x").is_err());
    }

    fn noop_step(version: &'static str, label: &'static str) -> MigrationStep {
        MigrationStep { version, label, run: || Ok(()) }
    }

    #[tokio::test]
    async fn migrations_apply_in_numeric_version_order() {
        let store = MemoryStore::new();
        let project = ProjectId::from("order-test");

        let registry = vec![
            MigrationStep {
                version: "0.10.0",
                label: "ten",
                run: || Ok(()),
            },
            MigrationStep {
                version: "0.2.0",
                label: "two",
                run: || Ok(()),
            },
        ];

        let coordinator = MigrationCoordinator::new(
            &store,
            registry,
            Duration::from_secs(5),
            Duration::from_millis(10),
        );
        coordinator.run(&project, false).await.unwrap();

        let mut applied = store.list_migrations(&project).await.unwrap();
        applied.sort_by_key(|m| m.started);
        let versions: Vec<_> = applied.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(versions, vec!["0.2.0", "0.10.0"]);
    }

    #[tokio::test]
    async fn a_migration_already_in_progress_blocks_a_concurrent_coordinator() {
        let store = MemoryStore::new();
        let project = ProjectId::from("race-test");

        store.create_migration(&project, "0.1.0", "first").await.unwrap();

        let registry = vec![noop_step("0.1.0", "first")];
        let coordinator = MigrationCoordinator::new(
            &store,
            registry,
            Duration::from_millis(50),
            Duration::from_millis(10),
        );

        let err = coordinator.run(&project, false).await.unwrap_err();
        assert!(matches!(err, MigrationError::Timeout(_)));
    }

    #[tokio::test]
    async fn two_coordinators_racing_the_same_version_only_one_wins() {
        let store = Arc::new(MemoryStore::new());
        let project = ProjectId::from("concurrent-test");
        let applied = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let store = store.clone();
            let project = project.clone();
            let applied = applied.clone();
            handles.push(tokio::spawn(async move {
                let registry = vec![MigrationStep {
                    version: "1.0.0",
                    label: "shared",
                    run: || Ok(()),
                }];
                let coordinator = MigrationCoordinator::new(
                    &*store,
                    registry,
                    Duration::from_secs(2),
                    Duration::from_millis(5),
                );
                if coordinator.run(&project, false).await.is_ok() {
                    applied.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let records = store.list_migrations(&project).await.unwrap();
        assert_eq!(records.len(), 1, "only one migration record should exist for the shared version");
        assert_eq!(records[0].status, MigrationStatus::Done);
    }
}
