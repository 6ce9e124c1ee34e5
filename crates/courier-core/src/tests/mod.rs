pub mod backup_job_tests;
pub mod send_tests;

use crate::config::{CoreConfig, DeviceState, StateHandle};
use crate::data::{InMemoryEnvelopeStore, InMemoryMessageStore, OutgoingMessage};
use crate::error::JobError;
use crate::events::EventBus;
use crate::job::{JobContext, JobHandler, JobRecord, JobRegistry};
use crate::manager::{JobManager, ManagerDeps};
use crate::policy::Policy;
use crate::store::JobStorage;
use crate::time::now_ms;
use crate::transport::MockTransport;
use async_trait::async_trait;
use courier_backup::source::BackupDataSource;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};
use uuid::Uuid;

pub struct Harness {
    pub manager: Arc<JobManager>,
    pub storage: Arc<JobStorage>,
    pub transport: MockTransport,
    pub messages: InMemoryMessageStore,
    pub envelopes: InMemoryEnvelopeStore,
    pub state: StateHandle,
    pub events: EventBus,
    _dir: tempfile::TempDir,
}

pub fn fast_policy() -> Policy {
    Policy {
        worker_count: 4,
        dispatch_tick_ms: 10,
        backoff_initial_ms: 10,
        backoff_max_ms: 40,
    }
}

pub fn test_config() -> CoreConfig {
    CoreConfig {
        local_user: "me".to_string(),
        namespace: "test".to_string(),
        ..CoreConfig::default()
    }
}

pub fn start_harness(registry: JobRegistry) -> Harness {
    start_harness_with(registry, test_config(), DeviceState::default(), None)
}

pub fn start_harness_with(
    registry: JobRegistry,
    config: CoreConfig,
    device: DeviceState,
    backup_source: Option<Arc<dyn BackupDataSource>>,
) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Arc::new(JobStorage::open(dir.path(), &config.namespace).expect("storage"));
    let transport = MockTransport::new();
    let messages = InMemoryMessageStore::new();
    let envelopes = InMemoryEnvelopeStore::new();
    let state = StateHandle::new(device);
    let events = EventBus::default();
    let manager = JobManager::start(ManagerDeps {
        storage: storage.clone(),
        registry,
        transport: Arc::new(transport.clone()),
        messages: Arc::new(messages.clone()),
        envelopes: Arc::new(envelopes.clone()),
        events: events.clone(),
        state: state.clone(),
        config: Arc::new(config),
        backup_source,
        policy: fast_policy(),
    });
    Harness {
        manager,
        storage,
        transport,
        messages,
        envelopes,
        state,
        events,
        _dir: dir,
    }
}

pub fn outgoing(group_id: &str) -> OutgoingMessage {
    OutgoingMessage {
        id: Uuid::new_v4(),
        group_id: group_id.to_string(),
        body: Some("hello".to_string()),
        attachments: Vec::new(),
        timestamp_ms: now_ms(),
        expires_in_secs: None,
        is_view_once: false,
        is_expiration_update: false,
    }
}

/// A handler driven by a prewritten script of outcomes; runs past the end
/// of the script succeed.
pub struct ScriptedJob {
    results: Mutex<Vec<Result<(), JobError>>>,
    pub runs: AtomicUsize,
    pub failures: AtomicUsize,
    pub log: Mutex<Vec<String>>,
}

impl ScriptedJob {
    pub fn new(results: Vec<Result<(), JobError>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results),
            runs: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn failure_count(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn log_entries(&self) -> Vec<String> {
        self.log.lock().expect("log").clone()
    }
}

#[async_trait]
impl JobHandler for ScriptedJob {
    async fn run(&self, record: &mut JobRecord, _ctx: &JobContext) -> Result<(), JobError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(name) = record.payload.get("name").and_then(|v| v.as_str()) {
            self.log.lock().expect("log").push(name.to_string());
        }
        let mut results = self.results.lock().expect("results");
        if results.is_empty() {
            Ok(())
        } else {
            results.remove(0)
        }
    }

    async fn on_failure(&self, _record: &JobRecord, _ctx: &JobContext) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

pub async fn wait_until<F, Fut>(label: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if condition().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {label}");
}
