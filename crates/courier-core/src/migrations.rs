use crate::error::CoreError;
use crate::job::{JobRecord, JOB_VERSION};
use crate::store::JobStorage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub detected: u32,
    pub target: u32,
    pub migrated_jobs: usize,
    pub applied: bool,
}

/// Rewrites a persisted record from one version to the next. Migrations
/// run in registration order at startup, before the scheduler starts.
pub trait JobMigration: Send + Sync {
    /// The record version this migration upgrades from.
    fn from_version(&self) -> u32;
    fn migrate(&self, record: JobRecord) -> JobRecord;
}

pub struct MigrationPlan {
    storage: Arc<JobStorage>,
    migrations: Vec<Box<dyn JobMigration>>,
}

impl MigrationPlan {
    pub fn new(storage: Arc<JobStorage>) -> Self {
        Self {
            storage,
            migrations: Vec::new(),
        }
    }

    pub fn register(&mut self, migration: Box<dyn JobMigration>) {
        self.migrations.push(migration);
    }

    pub async fn dry_run(&self) -> Result<MigrationReport, CoreError> {
        let detected = self
            .storage
            .version()
            .await
            .map_err(|_| CoreError::Storage)?;
        Ok(MigrationReport {
            detected,
            target: JOB_VERSION,
            migrated_jobs: 0,
            applied: false,
        })
    }

    /// Upgrades every pending record to the current version. Records whose
    /// kind no build understands were already mapped to `Dead` on decode;
    /// they stay pending and fail permanently on their first dispatch.
    pub async fn apply(&self) -> Result<MigrationReport, CoreError> {
        let detected = self
            .storage
            .version()
            .await
            .map_err(|_| CoreError::Storage)?;
        let mut records = self
            .storage
            .load_jobs()
            .await
            .map_err(|_| CoreError::Storage)?;
        let mut migrated = 0;
        for record in records.iter_mut() {
            while record.version < JOB_VERSION {
                let before = record.version;
                for migration in self.migrations.iter() {
                    if migration.from_version() == record.version {
                        *record = migration.migrate(record.clone());
                        record.version += 1;
                        break;
                    }
                }
                if record.version == before {
                    // No registered step; stamp forward so the loop ends.
                    record.version = JOB_VERSION;
                }
            }
            migrated += 1;
        }
        self.storage
            .replace_all(&records)
            .await
            .map_err(|_| CoreError::Storage)?;
        self.storage
            .set_version(JOB_VERSION)
            .await
            .map_err(|_| CoreError::Storage)?;
        info!(detected, target = JOB_VERSION, migrated, "job store migrated");
        Ok(MigrationReport {
            detected,
            target: JOB_VERSION,
            migrated_jobs: migrated,
            applied: true,
        })
    }
}
