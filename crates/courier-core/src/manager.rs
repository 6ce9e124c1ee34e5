use crate::config::{CoreConfig, StateHandle};
use crate::constraints::all_met;
use crate::data::{EnvelopeStore, MessageStore};
use crate::error::{CoreError, ErrorKind, JobError};
use crate::events::EventBus;
use crate::job::{Enqueuer, JobContext, JobRecord, JobRegistry};
use crate::policy::Policy;
use crate::store::JobStorage;
use crate::time::now_ms;
use crate::transport::Transport;
use courier_backup::cancel::CancellationSignal;
use courier_backup::source::BackupDataSource;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct ManagerDeps {
    pub storage: Arc<JobStorage>,
    pub registry: JobRegistry,
    pub transport: Arc<dyn Transport>,
    pub messages: Arc<dyn MessageStore>,
    pub envelopes: Arc<dyn EnvelopeStore>,
    pub events: EventBus,
    pub state: StateHandle,
    pub config: Arc<CoreConfig>,
    pub backup_source: Option<Arc<dyn BackupDataSource>>,
    pub policy: Policy,
}

struct RunningJob {
    queue: Option<String>,
    cancel: CancellationSignal,
}

#[derive(Default)]
struct Shared {
    running: Mutex<HashMap<Uuid, RunningJob>>,
    watchers: Mutex<HashMap<Uuid, Vec<oneshot::Sender<Result<(), JobError>>>>>,
}

struct Completion {
    record: JobRecord,
    result: Result<(), JobError>,
}

/// Durable job scheduler. One background task owns dispatch and completion
/// handling; workers only run their handler and report back, so every store
/// write happens on the scheduler task.
pub struct JobManager {
    storage: Arc<JobStorage>,
    registry: Arc<JobRegistry>,
    ctx: JobContext,
    policy: Policy,
    wake: Arc<Notify>,
    shared: Arc<Shared>,
    stopped: Arc<AtomicBool>,
}

impl JobManager {
    pub fn start(deps: ManagerDeps) -> Arc<Self> {
        let wake = Arc::new(Notify::new());
        deps.state.register_listener(wake.clone());
        let enqueuer = Enqueuer {
            storage: deps.storage.clone(),
            wake: wake.clone(),
        };
        let ctx = JobContext {
            transport: deps.transport,
            messages: deps.messages,
            envelopes: deps.envelopes,
            events: deps.events,
            state: deps.state,
            config: deps.config,
            backup_source: deps.backup_source,
            enqueuer,
            cancel: CancellationSignal::new(),
        };
        let manager = Arc::new(Self {
            storage: deps.storage,
            registry: Arc::new(deps.registry),
            ctx,
            policy: deps.policy,
            wake,
            shared: Arc::default(),
            stopped: Arc::new(AtomicBool::new(false)),
        });
        tokio::spawn(scheduler_loop(manager.clone()));
        manager
    }

    pub fn enqueuer(&self) -> Enqueuer {
        self.ctx.enqueuer.clone()
    }

    pub fn events(&self) -> EventBus {
        self.ctx.events.clone()
    }

    pub async fn enqueue(&self, record: JobRecord) -> Result<Uuid, CoreError> {
        self.ctx.enqueuer.enqueue(record).await
    }

    /// Enqueues a job that only becomes eligible once every listed job has
    /// left the pending set. If any dependency fails permanently, this job
    /// is failed without ever running.
    pub async fn enqueue_dependent(
        &self,
        mut record: JobRecord,
        dependencies: Vec<Uuid>,
    ) -> Result<Uuid, CoreError> {
        record.dependencies = dependencies;
        self.ctx.enqueuer.enqueue(record).await
    }

    /// Enqueues the job and waits for its terminal outcome. The outer error
    /// is a timeout; the inner result is whatever the job finished with.
    pub async fn run_synchronously(
        &self,
        record: JobRecord,
        timeout_ms: u64,
    ) -> Result<Result<(), JobError>, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .watchers
            .lock()
            .expect("watchers")
            .entry(record.id)
            .or_default()
            .push(tx);
        let record_id = record.id;
        if let Err(err) = self.enqueue(record).await {
            self.shared.watchers.lock().expect("watchers").remove(&record_id);
            return Err(err);
        }
        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(CoreError::Timeout),
            Err(_) => Err(CoreError::Timeout),
        }
    }

    /// Fails every pending job in the queue and signals cancellation to the
    /// ones currently running. Running jobs observe the signal and report a
    /// failure on their own.
    pub async fn cancel_all_in_queue(&self, queue: &str) -> Result<(), CoreError> {
        let pending = self
            .storage
            .load_jobs()
            .await
            .map_err(|_| CoreError::Storage)?;
        let running_ids: HashSet<Uuid> = {
            let running = self.shared.running.lock().expect("running");
            for job in running.values() {
                if job.queue.as_deref() == Some(queue) {
                    job.cancel.cancel();
                }
            }
            running.keys().copied().collect()
        };
        for record in pending {
            if record.parameters.queue.as_deref() != Some(queue)
                || running_ids.contains(&record.id)
            {
                continue;
            }
            info!(job = %record.id, queue, "canceling pending job");
            fail_permanently(
                &record,
                JobError::Permanent("canceled".to_string()),
                &self.storage,
                &self.registry,
                &self.ctx,
                &self.shared,
            )
            .await?;
        }
        self.wake.notify_one();
        Ok(())
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

async fn scheduler_loop(manager: Arc<JobManager>) {
    let (completion_tx, mut completion_rx) = mpsc::channel::<Completion>(64);
    let semaphore = Arc::new(Semaphore::new(manager.policy.worker_count));
    let mut tick =
        tokio::time::interval(Duration::from_millis(manager.policy.dispatch_tick_ms));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        if manager.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = dispatch_pass(&manager, &semaphore, &completion_tx).await {
            warn!(error = %err, "dispatch pass failed");
        }
        tokio::select! {
            _ = manager.wake.notified() => {}
            _ = tick.tick() => {}
            Some(completion) = completion_rx.recv() => {
                if let Err(err) = handle_completion(&manager, completion).await {
                    warn!(error = %err, "completion handling failed");
                }
                // Drain whatever else finished before dispatching again.
                while let Ok(completion) = completion_rx.try_recv() {
                    if let Err(err) = handle_completion(&manager, completion).await {
                        warn!(error = %err, "completion handling failed");
                    }
                }
            }
        }
    }
}

async fn dispatch_pass(
    manager: &Arc<JobManager>,
    semaphore: &Arc<Semaphore>,
    completion_tx: &mpsc::Sender<Completion>,
) -> Result<(), CoreError> {
    let now = now_ms();
    let records = manager
        .storage
        .load_jobs()
        .await
        .map_err(|_| CoreError::Storage)?;
    let state = manager.ctx.state.snapshot();
    let (running_ids, mut blocked_queues): (HashSet<Uuid>, HashSet<String>) = {
        let running = manager.shared.running.lock().expect("running");
        (
            running.keys().copied().collect(),
            running.values().filter_map(|job| job.queue.clone()).collect(),
        )
    };
    let pending_ids: HashSet<Uuid> = records.iter().map(|record| record.id).collect();

    for record in records {
        if running_ids.contains(&record.id) {
            continue;
        }
        let queue = record.parameters.queue.clone();
        if let Some(q) = &queue {
            if blocked_queues.contains(q) {
                continue;
            }
        }
        // Waiting on another job does not block the rest of its queue.
        if record
            .dependencies
            .iter()
            .any(|dep| pending_ids.contains(dep))
        {
            continue;
        }
        if record.expired_at(now) {
            debug!(job = %record.id, "job expired before running");
            fail_permanently(
                &record,
                JobError::Permanent("lifespan expired".to_string()),
                &manager.storage,
                &manager.registry,
                &manager.ctx,
                &manager.shared,
            )
            .await?;
            continue;
        }
        let eligible =
            record.next_run_ms <= now && all_met(&record.parameters.constraints, &state);
        if !eligible {
            // Queues run strictly in order, so everything behind waits too.
            if let Some(q) = queue {
                blocked_queues.insert(q);
            }
            continue;
        }
        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            return Ok(());
        };
        launch(manager, record, permit, completion_tx.clone()).await?;
        if let Some(q) = queue {
            blocked_queues.insert(q);
        }
    }
    Ok(())
}

async fn launch(
    manager: &Arc<JobManager>,
    mut record: JobRecord,
    permit: tokio::sync::OwnedSemaphorePermit,
    completion_tx: mpsc::Sender<Completion>,
) -> Result<(), CoreError> {
    record.attempts += 1;
    manager
        .storage
        .put_job(&record)
        .await
        .map_err(|_| CoreError::Storage)?;
    let cancel = CancellationSignal::new();
    manager.shared.running.lock().expect("running").insert(
        record.id,
        RunningJob {
            queue: record.parameters.queue.clone(),
            cancel: cancel.clone(),
        },
    );
    let handler = manager.registry.handler(record.kind);
    let mut ctx = manager.ctx.clone();
    ctx.cancel = cancel;
    debug!(job = %record.id, kind = record.kind.factory_key(), attempt = record.attempts, "running job");
    tokio::spawn(async move {
        let result = handler.run(&mut record, &ctx).await;
        drop(permit);
        let _ = completion_tx.send(Completion { record, result }).await;
    });
    Ok(())
}

async fn handle_completion(
    manager: &Arc<JobManager>,
    completion: Completion,
) -> Result<(), CoreError> {
    let Completion { mut record, result } = completion;
    manager
        .shared
        .running
        .lock()
        .expect("running")
        .remove(&record.id);
    match result {
        Ok(()) => {
            debug!(job = %record.id, "job succeeded");
            manager
                .storage
                .delete_job(record.id)
                .await
                .map_err(|_| CoreError::Storage)?;
            manager
                .storage
                .mark_succeeded(record.id)
                .await
                .map_err(|_| CoreError::Storage)?;
            notify_watchers(&manager.shared, record.id, Ok(()));
            Ok(())
        }
        Err(error) => match error.kind() {
            ErrorKind::RetryableTransient => {
                let now = now_ms();
                if record.expired_at(now)
                    || record.parameters.max_attempts.exhausted_by(record.attempts)
                {
                    fail_permanently(
                        &record,
                        error,
                        &manager.storage,
                        &manager.registry,
                        &manager.ctx,
                        &manager.shared,
                    )
                    .await
                } else {
                    record.next_run_ms = now + backoff_delay(record.attempts, &manager.policy);
                    debug!(job = %record.id, attempt = record.attempts, next_run = record.next_run_ms, "job retrying");
                    manager
                        .storage
                        .put_job(&record)
                        .await
                        .map_err(|_| CoreError::Storage)
                }
            }
            ErrorKind::RetryablePrecondition => {
                let now = now_ms();
                if record.expired_at(now) {
                    fail_permanently(
                        &record,
                        error,
                        &manager.storage,
                        &manager.registry,
                        &manager.ctx,
                        &manager.shared,
                    )
                    .await
                } else {
                    // Waiting on a precondition never consumes an attempt.
                    record.attempts = record.attempts.saturating_sub(1);
                    record.next_run_ms = now + manager.policy.backoff_initial_ms;
                    manager
                        .storage
                        .put_job(&record)
                        .await
                        .map_err(|_| CoreError::Storage)
                }
            }
            ErrorKind::PermanentContent | ErrorKind::Fatal => {
                fail_permanently(
                    &record,
                    error,
                    &manager.storage,
                    &manager.registry,
                    &manager.ctx,
                    &manager.shared,
                )
                .await
            }
        },
    }
}

/// Runs `on_failure` exactly once, removes the record, and fails every
/// pending job that depended on it, transitively.
async fn fail_permanently(
    record: &JobRecord,
    error: JobError,
    storage: &Arc<JobStorage>,
    registry: &Arc<JobRegistry>,
    ctx: &JobContext,
    shared: &Arc<Shared>,
) -> Result<(), CoreError> {
    warn!(job = %record.id, kind = record.kind.factory_key(), error = %error, "job failed permanently");
    registry.handler(record.kind).on_failure(record, ctx).await;
    storage
        .delete_job(record.id)
        .await
        .map_err(|_| CoreError::Storage)?;
    storage
        .mark_failed(record.id)
        .await
        .map_err(|_| CoreError::Storage)?;
    notify_watchers(shared, record.id, Err(error));

    let mut failed = HashSet::new();
    failed.insert(record.id);
    loop {
        let pending = storage.load_jobs().await.map_err(|_| CoreError::Storage)?;
        let dependents: Vec<JobRecord> = pending
            .into_iter()
            .filter(|job| job.dependencies.iter().any(|dep| failed.contains(dep)))
            .collect();
        if dependents.is_empty() {
            return Ok(());
        }
        for dependent in dependents {
            warn!(job = %dependent.id, "failing dependent job");
            registry
                .handler(dependent.kind)
                .on_failure(&dependent, ctx)
                .await;
            storage
                .delete_job(dependent.id)
                .await
                .map_err(|_| CoreError::Storage)?;
            storage
                .mark_failed(dependent.id)
                .await
                .map_err(|_| CoreError::Storage)?;
            notify_watchers(
                shared,
                dependent.id,
                Err(JobError::Permanent("dependency failed".to_string())),
            );
            failed.insert(dependent.id);
        }
    }
}

fn notify_watchers(shared: &Arc<Shared>, id: Uuid, result: Result<(), JobError>) {
    let senders = shared
        .watchers
        .lock()
        .expect("watchers")
        .remove(&id)
        .unwrap_or_default();
    for sender in senders {
        let _ = sender.send(result.clone());
    }
}

/// Exponential backoff with jitter. Doubles per attempt up to the cap, then
/// adds up to half the delay again so synchronized retries spread out.
fn backoff_delay(attempts: u32, policy: &Policy) -> u64 {
    let tries = attempts.max(1);
    let factor = 1u64 << u64::from((tries - 1).min(16));
    let base = policy.backoff_initial_ms.saturating_mul(factor);
    let capped = base.min(policy.backoff_max_ms);
    let jitter = rand::thread_rng().gen_range(0..=capped / 2);
    capped + jitter
}
