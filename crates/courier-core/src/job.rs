use crate::config::{CoreConfig, StateHandle};
use crate::constraints::ConstraintKey;
use crate::data::{EnvelopeStore, MessageStore};
use crate::error::{CoreError, JobError};
use crate::events::EventBus;
use crate::time::now_ms;
use crate::transport::Transport;
use async_trait::async_trait;
use courier_backup::cancel::CancellationSignal;
use courier_backup::source::BackupDataSource;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

pub const JOB_VERSION: u32 = 1;

/// Persisted job identity. Serialized as a stable factory key so records
/// written by older builds still resolve; unknown keys map to [`JobKind::Dead`]
/// and are failed permanently instead of crashing the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    GroupSend,
    ReactionSend,
    ResendMessage,
    AttachmentUpload,
    ReceiptSend,
    ProcessEnvelope,
    GroupInfoRequest,
    LocalBackup,
    Dead,
}

impl JobKind {
    pub fn factory_key(self) -> &'static str {
        match self {
            JobKind::GroupSend => "GroupSend",
            JobKind::ReactionSend => "ReactionSend",
            JobKind::ResendMessage => "ResendMessage",
            JobKind::AttachmentUpload => "AttachmentUpload",
            JobKind::ReceiptSend => "ReceiptSend",
            JobKind::ProcessEnvelope => "ProcessEnvelope",
            JobKind::GroupInfoRequest => "GroupInfoRequest",
            JobKind::LocalBackup => "LocalBackup",
            JobKind::Dead => "Dead",
        }
    }

    pub fn from_factory_key(key: &str) -> Self {
        match key {
            "GroupSend" => JobKind::GroupSend,
            "ReactionSend" => JobKind::ReactionSend,
            "ResendMessage" => JobKind::ResendMessage,
            "AttachmentUpload" => JobKind::AttachmentUpload,
            "ReceiptSend" => JobKind::ReceiptSend,
            "ProcessEnvelope" => JobKind::ProcessEnvelope,
            "GroupInfoRequest" => JobKind::GroupInfoRequest,
            "LocalBackup" => JobKind::LocalBackup,
            _ => JobKind::Dead,
        }
    }
}

impl Serialize for JobKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.factory_key())
    }
}

impl<'de> Deserialize<'de> for JobKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        if key.is_empty() {
            return Err(D::Error::custom("empty job kind"));
        }
        Ok(JobKind::from_factory_key(&key))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MaxAttempts {
    Limited(u32),
    Unlimited,
}

impl MaxAttempts {
    pub fn exhausted_by(self, attempts: u32) -> bool {
        match self {
            MaxAttempts::Limited(limit) => attempts >= limit,
            MaxAttempts::Unlimited => false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Parameters {
    pub queue: Option<String>,
    pub constraints: Vec<ConstraintKey>,
    pub max_attempts: MaxAttempts,
    /// Wall-clock lifetime from creation; `None` means the job never expires.
    pub lifespan_ms: Option<u64>,
    /// At most this many pending instances of the kind may exist at once.
    pub instance_limit: Option<usize>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            queue: None,
            constraints: Vec::new(),
            max_attempts: MaxAttempts::Limited(10),
            lifespan_ms: None,
            instance_limit: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub parameters: Parameters,
    pub attempts: u32,
    pub created_at_ms: u64,
    pub next_run_ms: u64,
    /// Monotonic enqueue counter, assigned by the store on first insert.
    /// Queue order is decided by this, never by wall-clock time.
    #[serde(default)]
    pub sequence: u64,
    pub dependencies: Vec<Uuid>,
    pub version: u32,
}

impl JobRecord {
    pub fn new(kind: JobKind, payload: serde_json::Value, parameters: Parameters) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            parameters,
            attempts: 0,
            created_at_ms: now,
            next_run_ms: now,
            sequence: 0,
            dependencies: Vec::new(),
            version: JOB_VERSION,
        }
    }

    pub fn expired_at(&self, now: u64) -> bool {
        match self.parameters.lifespan_ms {
            Some(lifespan) => now.saturating_sub(self.created_at_ms) > lifespan,
            None => false,
        }
    }
}

/// Shared collaborators handed to every running job.
#[derive(Clone)]
pub struct JobContext {
    pub transport: Arc<dyn Transport>,
    pub messages: Arc<dyn MessageStore>,
    pub envelopes: Arc<dyn EnvelopeStore>,
    pub events: EventBus,
    pub state: StateHandle,
    pub config: Arc<CoreConfig>,
    pub backup_source: Option<Arc<dyn BackupDataSource>>,
    pub enqueuer: Enqueuer,
    pub cancel: CancellationSignal,
}

/// Lets a running job schedule follow-up jobs without holding the manager.
#[derive(Clone)]
pub struct Enqueuer {
    pub(crate) storage: Arc<crate::store::JobStorage>,
    pub(crate) wake: Arc<Notify>,
}

impl Enqueuer {
    pub async fn enqueue(&self, mut record: JobRecord) -> Result<Uuid, CoreError> {
        let id = record.id;
        if let Some(limit) = record.parameters.instance_limit {
            let pending = self
                .storage
                .load_jobs()
                .await
                .map_err(|_| CoreError::Storage)?
                .iter()
                .filter(|job| job.kind == record.kind)
                .count();
            if pending >= limit {
                return Err(CoreError::Validation("instance_limit".to_string()));
            }
        }
        self.storage
            .insert_job(&mut record)
            .await
            .map_err(|_| CoreError::Storage)?;
        self.wake.notify_one();
        Ok(id)
    }
}

/// A unit of work. `run` may mutate the record's payload; on a transient
/// failure the scheduler persists the mutated record, so partial progress
/// (e.g. recipients already delivered to) survives the retry.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, record: &mut JobRecord, ctx: &JobContext) -> Result<(), JobError>;

    /// Called exactly once when the job fails permanently (including
    /// cancellation and retry exhaustion), before the record is deleted.
    async fn on_failure(&self, _record: &JobRecord, _ctx: &JobContext) {}
}

/// No-op handler for records whose kind no build understands anymore.
pub struct DeadJob;

#[async_trait]
impl JobHandler for DeadJob {
    async fn run(&self, record: &mut JobRecord, _ctx: &JobContext) -> Result<(), JobError> {
        Err(JobError::Permanent(format!(
            "no handler for job {}",
            record.id
        )))
    }
}

pub struct JobRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    dead: Arc<dyn JobHandler>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            dead: Arc::new(DeadJob),
        }
    }

    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn handler(&self, kind: JobKind) -> Arc<dyn JobHandler> {
        self.handlers
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| self.dead.clone())
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
