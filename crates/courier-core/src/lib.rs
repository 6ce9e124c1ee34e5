pub mod backup_job;
pub mod config;
pub mod constraints;
pub mod data;
pub mod envelope;
pub mod error;
pub mod events;
pub mod job;
pub mod manager;
pub mod migrations;
pub mod policy;
pub mod receive;
pub mod send;
pub mod store;
pub mod time;
pub mod transport;

pub use config::{CoreConfig, DeviceState, StateHandle};
pub use error::{CoreError, DecryptError, ErrorKind, JobError};
pub use events::{CoreEvent, EventBus};
pub use job::{JobKind, JobRecord, JobRegistry, MaxAttempts, Parameters};
pub use manager::{JobManager, ManagerDeps};
pub use policy::Policy;

use crate::backup_job::LocalBackupJob;
use crate::receive::ProcessEnvelopeJob;
use crate::send::{
    AttachmentUploadJob, GroupInfoRequestJob, GroupSendJob, ReactionSendJob, ReceiptSendJob,
    ResendMessageJob,
};
use std::sync::Arc;

/// Registry with every built-in job wired to its handler.
pub fn standard_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register(JobKind::GroupSend, Arc::new(GroupSendJob));
    registry.register(JobKind::ReactionSend, Arc::new(ReactionSendJob));
    registry.register(JobKind::ResendMessage, Arc::new(ResendMessageJob));
    registry.register(JobKind::AttachmentUpload, Arc::new(AttachmentUploadJob));
    registry.register(JobKind::ReceiptSend, Arc::new(ReceiptSendJob));
    registry.register(JobKind::ProcessEnvelope, Arc::new(ProcessEnvelopeJob));
    registry.register(JobKind::GroupInfoRequest, Arc::new(GroupInfoRequestJob));
    registry.register(JobKind::LocalBackup, Arc::new(LocalBackupJob));
    registry
}

#[cfg(test)]
mod tests;
