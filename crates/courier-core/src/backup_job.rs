use crate::error::JobError;
use crate::events::CoreEvent;
use crate::job::{JobContext, JobHandler, JobKind, JobRecord, MaxAttempts, Parameters};
use async_trait::async_trait;
use courier_backup::error::BackupError;
use courier_backup::export::export;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

pub const BACKUP_QUEUE: &str = "__BACKUP__";

#[derive(Serialize, Deserialize)]
pub struct LocalBackupPayload {
    pub output_path: String,
    pub passphrase: String,
}

/// Exports the full data source to an encrypted archive on local storage.
/// The export writes to a scratch file and only renames it into place once
/// the terminal frame is down, so a crash or cancellation never leaves a
/// plausible-looking partial archive.
pub struct LocalBackupJob;

impl LocalBackupJob {
    pub fn record(output_path: &str, passphrase: &str) -> JobRecord {
        let payload = serde_json::to_value(LocalBackupPayload {
            output_path: output_path.to_string(),
            passphrase: passphrase.to_string(),
        })
        .unwrap_or_default();
        JobRecord::new(
            JobKind::LocalBackup,
            payload,
            Parameters {
                queue: Some(BACKUP_QUEUE.to_string()),
                max_attempts: MaxAttempts::Limited(1),
                instance_limit: Some(1),
                ..Parameters::default()
            },
        )
    }
}

#[async_trait]
impl JobHandler for LocalBackupJob {
    async fn run(&self, record: &mut JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let payload: LocalBackupPayload = serde_json::from_value(record.payload.clone())
            .map_err(|err| JobError::Fatal(format!("payload: {err}")))?;
        let Some(source) = ctx.backup_source.clone() else {
            return Err(JobError::Fatal("no backup source configured".to_string()));
        };
        let final_path = PathBuf::from(&payload.output_path);
        let part_path = PathBuf::from(format!("{}.part", payload.output_path));
        let cancel = ctx.cancel.clone();
        let events = ctx.events.clone();
        let passphrase = payload.passphrase.clone();
        let scratch = part_path.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut sink = fs::File::create(&scratch).map_err(BackupError::Io)?;
            export(source.as_ref(), &mut sink, &passphrase, &cancel, &mut |frames| {
                events.emit(CoreEvent::BackupProgress { frames });
            })
        })
        .await
        .map_err(|_| JobError::Fatal("backup task panicked".to_string()))?;
        match result {
            Ok(()) => {
                fs::rename(&part_path, &final_path)
                    .map_err(|err| JobError::Permanent(format!("finalize: {err}")))?;
                info!(path = %final_path.display(), "backup written");
                ctx.events.emit(CoreEvent::BackupFinished {
                    path: payload.output_path,
                });
                Ok(())
            }
            Err(BackupError::Canceled) => {
                let _ = fs::remove_file(&part_path);
                info!("backup canceled");
                Err(JobError::Permanent("canceled".to_string()))
            }
            Err(err) => {
                let _ = fs::remove_file(&part_path);
                warn!(error = %err, "backup failed");
                Err(JobError::Permanent(format!("export: {err}")))
            }
        }
    }
}
