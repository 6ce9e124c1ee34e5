use super::{start_harness_with, test_config, wait_until};
use crate::backup_job::LocalBackupJob;
use crate::config::DeviceState;
use crate::events::CoreEvent;
use crate::standard_registry;
use courier_backup::frame::{SqlParameter, SqlStatement};
use courier_backup::import::read_all;
use courier_backup::source::{InMemoryDataSource, TableRow};
use std::fs;
use std::sync::Arc;

fn source() -> Arc<InMemoryDataSource> {
    let mut source = InMemoryDataSource::new(3);
    source.add_table(
        "messages",
        vec![TableRow {
            statement: SqlStatement {
                statement: "INSERT INTO messages VALUES (?)".to_string(),
                parameters: vec![SqlParameter::Text("hello".to_string())],
            },
            expired: false,
        }],
    );
    Arc::new(source)
}

#[tokio::test]
async fn backup_job_writes_a_readable_archive() {
    let harness = start_harness_with(
        standard_registry(),
        test_config(),
        DeviceState::default(),
        Some(source()),
    );
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("backup.bin");
    let output_str = output.to_string_lossy().to_string();
    let mut events = harness.events.subscribe();

    let job = LocalBackupJob::record(&output_str, "hunter2");
    let id = harness.manager.enqueue(job).await.expect("enqueue");
    wait_until("backup done", || async {
        harness.storage.succeeded().await.contains(&id)
    })
    .await;

    let bytes = fs::read(&output).expect("archive");
    let contents = read_all(bytes.as_slice(), "hunter2").expect("read");
    assert_eq!(contents.database_version, 3);
    assert!(contents
        .statements
        .iter()
        .any(|s| s.statement.starts_with("INSERT INTO messages")));
    assert!(
        !output.with_extension("bin.part").exists(),
        "scratch file must be renamed away"
    );

    let mut saw_progress = false;
    let mut saw_finished = false;
    while let Ok(event) = events.try_recv() {
        match event {
            CoreEvent::BackupProgress { .. } => saw_progress = true,
            CoreEvent::BackupFinished { path } => {
                saw_finished = true;
                assert_eq!(path, output_str);
            }
            _ => {}
        }
    }
    assert!(saw_progress);
    assert!(saw_finished);
}

#[tokio::test]
async fn backup_job_without_a_source_fails() {
    let harness = start_harness_with(
        standard_registry(),
        test_config(),
        DeviceState::default(),
        None,
    );
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("backup.bin").to_string_lossy().to_string();
    let job = LocalBackupJob::record(&output, "hunter2");
    let id = harness.manager.enqueue(job).await.expect("enqueue");
    wait_until("backup failed", || async {
        harness.storage.failed().await.contains(&id)
    })
    .await;
}

#[tokio::test]
async fn only_one_backup_may_be_pending() {
    let harness = start_harness_with(
        standard_registry(),
        test_config(),
        DeviceState::default(),
        Some(source()),
    );
    // Gate the queue so the first record stays pending.
    harness.state.set_migrations_pending(true);
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("backup.bin").to_string_lossy().to_string();
    let mut first = LocalBackupJob::record(&output, "hunter2");
    first
        .parameters
        .constraints
        .push(crate::constraints::ConstraintKey::MigrationsComplete);
    harness.manager.enqueue(first).await.expect("enqueue");
    let second = LocalBackupJob::record(&output, "hunter2");
    let err = harness.manager.enqueue(second).await.expect_err("limit");
    assert!(matches!(
        err,
        crate::error::CoreError::Validation(reason) if reason == "instance_limit"
    ));
}
