use crate::data::{FailureKind, OutgoingMessage, RecipientFailure};
use crate::envelope::{DataMessage, GroupContext, GroupContextKind, ReactionContent, ReceiptKind};
use crate::error::JobError;
use crate::events::CoreEvent;
use crate::job::{JobContext, JobHandler, JobKind, JobRecord, MaxAttempts, Parameters};
use crate::time::now_ms;
use crate::transport::{OutboundContent, OutboundPayload, RecipientSendResult, SendOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

fn decode_payload<T: for<'de> Deserialize<'de>>(record: &JobRecord) -> Result<T, JobError> {
    serde_json::from_value(record.payload.clone())
        .map_err(|err| JobError::Fatal(format!("payload: {err}")))
}

async fn access_map(
    ctx: &JobContext,
    recipients: &[String],
) -> Result<HashMap<String, Vec<u8>>, JobError> {
    let mut map = HashMap::new();
    for recipient in recipients {
        if let Some(key) = ctx
            .messages
            .unidentified_access(recipient)
            .await
            .map_err(|_| JobError::Transient("store".to_string()))?
        {
            map.insert(recipient.clone(), key);
        }
    }
    Ok(map)
}

fn data_payload(message: &OutgoingMessage) -> OutboundPayload {
    OutboundPayload {
        timestamp_ms: message.timestamp_ms,
        content: OutboundContent::Data(DataMessage {
            body: message.body.clone(),
            attachments: message.attachments.clone(),
            group_context: Some(GroupContext {
                group_id: message.group_id.clone(),
                kind: GroupContextKind::Deliver,
            }),
            expires_in_secs: message.expires_in_secs,
            is_expiration_update: message.is_expiration_update,
            is_view_once: message.is_view_once,
            ..DataMessage::default()
        }),
    }
}

#[derive(Serialize, Deserialize)]
pub struct GroupSendPayload {
    pub message_id: Uuid,
    pub group_id: String,
    /// When non-empty, delivery is restricted to exactly these members.
    #[serde(default)]
    pub filter: Vec<String>,
}

/// Delivers one outgoing group message, tracking per-recipient outcomes so a
/// retry only re-sends to the recipients that still need it.
pub struct GroupSendJob;

impl GroupSendJob {
    pub fn record(message_id: Uuid, group_id: &str, filter: Vec<String>) -> JobRecord {
        let payload = serde_json::to_value(GroupSendPayload {
            message_id,
            group_id: group_id.to_string(),
            filter,
        })
        .unwrap_or_default();
        JobRecord::new(
            JobKind::GroupSend,
            payload,
            Parameters {
                queue: Some(format!("send:{group_id}")),
                constraints: vec![crate::constraints::ConstraintKey::Network],
                lifespan_ms: Some(24 * 60 * 60 * 1_000),
                ..Parameters::default()
            },
        )
    }

    async fn targets(
        &self,
        payload: &GroupSendPayload,
        ctx: &JobContext,
    ) -> Result<Vec<String>, JobError> {
        if !payload.filter.is_empty() {
            return Ok(payload.filter.clone());
        }
        // Identity mismatches are waiting on the user, not on the network;
        // only network failures are fair game for a retry.
        let mut network_failures = Vec::new();
        let mut identity_blocked = HashSet::new();
        for failure in ctx
            .messages
            .failures(payload.message_id)
            .await
            .map_err(|_| JobError::Transient("store".to_string()))?
        {
            match failure.kind {
                FailureKind::Network => network_failures.push(failure.recipient),
                FailureKind::Identity => {
                    identity_blocked.insert(failure.recipient);
                }
            }
        }
        if !network_failures.is_empty() {
            return Ok(network_failures);
        }
        let members = ctx
            .messages
            .group_members(&payload.group_id)
            .await
            .map_err(|_| JobError::Transient("store".to_string()))?;
        let done = ctx
            .messages
            .successful_recipients(payload.message_id)
            .await
            .map_err(|_| JobError::Transient("store".to_string()))?;
        Ok(members
            .into_iter()
            .filter(|member| {
                member != &ctx.config.local_user
                    && !done.contains(member)
                    && !identity_blocked.contains(member)
            })
            .collect())
    }

    async fn reconcile(
        &self,
        message_id: Uuid,
        results: &[RecipientSendResult],
        ctx: &JobContext,
    ) -> Result<usize, JobError> {
        let mut network = 0;
        for result in results {
            match result.outcome {
                SendOutcome::Success { .. } => {
                    ctx.messages
                        .record_success(message_id, &result.recipient)
                        .await
                        .map_err(|_| JobError::Transient("store".to_string()))?;
                    ctx.messages
                        .remove_failure(message_id, &result.recipient)
                        .await
                        .map_err(|_| JobError::Transient("store".to_string()))?;
                }
                SendOutcome::NetworkFailure => {
                    network += 1;
                    ctx.messages
                        .add_failure(
                            message_id,
                            RecipientFailure {
                                recipient: result.recipient.clone(),
                                kind: FailureKind::Network,
                            },
                        )
                        .await
                        .map_err(|_| JobError::Transient("store".to_string()))?;
                }
                SendOutcome::IdentityMismatch => {
                    ctx.messages
                        .add_failure(
                            message_id,
                            RecipientFailure {
                                recipient: result.recipient.clone(),
                                kind: FailureKind::Identity,
                            },
                        )
                        .await
                        .map_err(|_| JobError::Transient("store".to_string()))?;
                }
            }
        }
        Ok(network)
    }
}

#[async_trait]
impl JobHandler for GroupSendJob {
    async fn run(&self, record: &mut JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let payload: GroupSendPayload = decode_payload(record)?;
        let Some(message) = ctx
            .messages
            .outgoing_message(payload.message_id)
            .await
            .map_err(|_| JobError::Transient("store".to_string()))?
        else {
            debug!(message = %payload.message_id, "message deleted before send");
            return Ok(());
        };
        let targets = self.targets(&payload, ctx).await?;
        if !targets.is_empty() {
            let access = access_map(ctx, &targets).await?;
            let results = ctx
                .transport
                .send(&targets, &data_payload(&message), &access)
                .await?;
            let network = self.reconcile(payload.message_id, &results, ctx).await?;
            if network > 0 {
                return Err(JobError::Transient(format!(
                    "{network} recipients unreachable"
                )));
            }
        }
        // The stored failure list, not this attempt's results, decides the
        // outcome: an identity mismatch recorded on an earlier attempt still
        // blocks the message until the user approves the new safety number.
        let identity_failures: Vec<String> = ctx
            .messages
            .failures(payload.message_id)
            .await
            .map_err(|_| JobError::Transient("store".to_string()))?
            .into_iter()
            .filter(|f| f.kind == FailureKind::Identity)
            .map(|f| f.recipient)
            .collect();
        if !identity_failures.is_empty() {
            warn!(
                message = %payload.message_id,
                identity = identity_failures.len(),
                "send blocked by identity change"
            );
            ctx.messages
                .mark_send_failed(payload.message_id)
                .await
                .map_err(|_| JobError::Transient("store".to_string()))?;
            ctx.events.emit(CoreEvent::SafetyNumberChange {
                message_id: payload.message_id,
                recipients: identity_failures,
            });
            return Ok(());
        }
        info!(message = %payload.message_id, "group message delivered");
        ctx.messages
            .mark_sent(payload.message_id)
            .await
            .map_err(|_| JobError::Transient("store".to_string()))?;
        if message.expires_in_secs.is_some() {
            ctx.messages
                .start_expiration(payload.message_id)
                .await
                .map_err(|_| JobError::Transient("store".to_string()))?;
        }
        if message.is_view_once {
            ctx.messages
                .delete_view_once_payload(payload.message_id)
                .await
                .map_err(|_| JobError::Transient("store".to_string()))?;
        }
        ctx.events.emit(CoreEvent::MessageSent {
            message_id: payload.message_id,
        });
        Ok(())
    }

    async fn on_failure(&self, record: &JobRecord, ctx: &JobContext) {
        let Ok(payload) = decode_payload::<GroupSendPayload>(record) else {
            return;
        };
        let _ = ctx.messages.mark_send_failed(payload.message_id).await;
        ctx.events.emit(CoreEvent::MessageFailed {
            message_id: payload.message_id,
        });
    }
}

#[derive(Serialize, Deserialize)]
pub struct ReactionSendPayload {
    pub message_id: Uuid,
    pub emoji: String,
    pub remove: bool,
    pub target_author: String,
    pub target_timestamp_ms: u64,
    /// Recipients still owed this reaction. Shrinks across retries.
    pub recipients: Vec<String>,
    pub initial_recipient_count: usize,
}

/// Sends a reaction add or remove. The local database was already updated
/// when the job was enqueued; if nobody received the reaction by the time
/// the job dies, that database change is rolled back.
pub struct ReactionSendJob;

impl ReactionSendJob {
    pub fn record(
        message_id: Uuid,
        emoji: &str,
        remove: bool,
        target_author: &str,
        target_timestamp_ms: u64,
        recipients: Vec<String>,
    ) -> JobRecord {
        let count = recipients.len();
        let payload = serde_json::to_value(ReactionSendPayload {
            message_id,
            emoji: emoji.to_string(),
            remove,
            target_author: target_author.to_string(),
            target_timestamp_ms,
            recipients,
            initial_recipient_count: count,
        })
        .unwrap_or_default();
        JobRecord::new(
            JobKind::ReactionSend,
            payload,
            Parameters {
                queue: Some(format!("reaction:{message_id}")),
                constraints: vec![crate::constraints::ConstraintKey::Network],
                max_attempts: MaxAttempts::Limited(5),
                lifespan_ms: Some(24 * 60 * 60 * 1_000),
                ..Parameters::default()
            },
        )
    }
}

#[async_trait]
impl JobHandler for ReactionSendJob {
    async fn run(&self, record: &mut JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let mut payload: ReactionSendPayload = decode_payload(record)?;
        let stored = ctx
            .messages
            .reaction(payload.message_id, &ctx.config.local_user)
            .await
            .map_err(|_| JobError::Transient("store".to_string()))?;
        // The user may have changed their mind since this was enqueued.
        // Only send what the database still says.
        let consistent = if payload.remove {
            stored.is_none()
        } else {
            stored.as_deref() == Some(payload.emoji.as_str())
        };
        if !consistent {
            debug!(message = %payload.message_id, "reaction no longer matches, skipping send");
            return Ok(());
        }
        if payload.recipients.is_empty() {
            return Ok(());
        }
        let outbound = OutboundPayload {
            timestamp_ms: now_ms(),
            content: OutboundContent::Data(DataMessage {
                reaction: Some(ReactionContent {
                    emoji: payload.emoji.clone(),
                    remove: payload.remove,
                    target_author: payload.target_author.clone(),
                    target_timestamp_ms: payload.target_timestamp_ms,
                }),
                ..DataMessage::default()
            }),
        };
        let access = access_map(ctx, &payload.recipients).await?;
        let results = ctx
            .transport
            .send(&payload.recipients, &outbound, &access)
            .await?;
        let mut remaining = Vec::new();
        for result in results {
            match result.outcome {
                SendOutcome::Success { .. } => {}
                SendOutcome::NetworkFailure => remaining.push(result.recipient),
                // Not worth blocking a reaction on an identity change.
                SendOutcome::IdentityMismatch => {}
            }
        }
        payload.recipients = remaining;
        record.payload = serde_json::to_value(&payload)
            .map_err(|err| JobError::Fatal(format!("payload: {err}")))?;
        if payload.recipients.is_empty() {
            Ok(())
        } else {
            Err(JobError::Transient(format!(
                "{} recipients unreachable",
                payload.recipients.len()
            )))
        }
    }

    async fn on_failure(&self, record: &JobRecord, ctx: &JobContext) {
        let Ok(payload) = decode_payload::<ReactionSendPayload>(record) else {
            return;
        };
        // Roll the local change back only when nobody received it.
        if payload.recipients.len() < payload.initial_recipient_count {
            return;
        }
        warn!(message = %payload.message_id, "reaction undelivered, rolling back");
        if payload.remove {
            let _ = ctx
                .messages
                .add_reaction(payload.message_id, &ctx.config.local_user, &payload.emoji)
                .await;
        } else {
            let _ = ctx
                .messages
                .delete_reaction(payload.message_id, &ctx.config.local_user)
                .await;
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct ResendMessagePayload {
    pub message_id: Uuid,
    pub recipient: String,
}

/// Re-sends one message to one recipient, used after the user approves a
/// safety number change.
pub struct ResendMessageJob;

impl ResendMessageJob {
    pub fn record(message_id: Uuid, recipient: &str) -> JobRecord {
        let payload = serde_json::to_value(ResendMessagePayload {
            message_id,
            recipient: recipient.to_string(),
        })
        .unwrap_or_default();
        JobRecord::new(
            JobKind::ResendMessage,
            payload,
            Parameters {
                queue: Some(format!("send:{recipient}")),
                constraints: vec![crate::constraints::ConstraintKey::Network],
                lifespan_ms: Some(24 * 60 * 60 * 1_000),
                ..Parameters::default()
            },
        )
    }
}

#[async_trait]
impl JobHandler for ResendMessageJob {
    async fn run(&self, record: &mut JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let payload: ResendMessagePayload = decode_payload(record)?;
        let Some(message) = ctx
            .messages
            .outgoing_message(payload.message_id)
            .await
            .map_err(|_| JobError::Transient("store".to_string()))?
        else {
            return Ok(());
        };
        let targets = vec![payload.recipient.clone()];
        let access = access_map(ctx, &targets).await?;
        let results = ctx
            .transport
            .send(&targets, &data_payload(&message), &access)
            .await?;
        match results.first().map(|r| &r.outcome) {
            Some(SendOutcome::Success { .. }) => {
                ctx.messages
                    .record_success(payload.message_id, &payload.recipient)
                    .await
                    .map_err(|_| JobError::Transient("store".to_string()))?;
                ctx.messages
                    .remove_failure(payload.message_id, &payload.recipient)
                    .await
                    .map_err(|_| JobError::Transient("store".to_string()))?;
                Ok(())
            }
            Some(SendOutcome::IdentityMismatch) => {
                ctx.messages
                    .add_failure(
                        payload.message_id,
                        RecipientFailure {
                            recipient: payload.recipient.clone(),
                            kind: FailureKind::Identity,
                        },
                    )
                    .await
                    .map_err(|_| JobError::Transient("store".to_string()))?;
                ctx.events.emit(CoreEvent::SafetyNumberChange {
                    message_id: payload.message_id,
                    recipients: vec![payload.recipient],
                });
                Ok(())
            }
            _ => Err(JobError::Transient("recipient unreachable".to_string())),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct AttachmentUploadPayload {
    pub message_id: Uuid,
    pub index: usize,
}

/// Uploads one attachment and records its server location. Send jobs that
/// need the upload depend on this job.
pub struct AttachmentUploadJob;

impl AttachmentUploadJob {
    pub fn record(message_id: Uuid, index: usize) -> JobRecord {
        let payload = serde_json::to_value(AttachmentUploadPayload { message_id, index })
            .unwrap_or_default();
        JobRecord::new(
            JobKind::AttachmentUpload,
            payload,
            Parameters {
                queue: Some(format!("upload:{message_id}")),
                constraints: vec![crate::constraints::ConstraintKey::Network],
                lifespan_ms: Some(24 * 60 * 60 * 1_000),
                ..Parameters::default()
            },
        )
    }
}

#[async_trait]
impl JobHandler for AttachmentUploadJob {
    async fn run(&self, record: &mut JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let payload: AttachmentUploadPayload = decode_payload(record)?;
        let data = ctx
            .messages
            .attachment_data(payload.message_id, payload.index)
            .await
            .map_err(|_| JobError::Permanent("attachment data missing".to_string()))?;
        let remote = ctx.transport.upload_attachment(&data).await?;
        ctx.messages
            .set_attachment_remote(payload.message_id, payload.index, remote.remote_id)
            .await
            .map_err(|_| JobError::Transient("store".to_string()))?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
pub struct ReceiptSendPayload {
    pub recipient: String,
    pub read: bool,
    pub timestamps: Vec<u64>,
}

/// Sends a delivery or read receipt. Read receipts respect the local
/// privacy setting at send time, not enqueue time.
pub struct ReceiptSendJob;

impl ReceiptSendJob {
    pub fn record(recipient: &str, read: bool, timestamps: Vec<u64>) -> JobRecord {
        let payload = serde_json::to_value(ReceiptSendPayload {
            recipient: recipient.to_string(),
            read,
            timestamps,
        })
        .unwrap_or_default();
        JobRecord::new(
            JobKind::ReceiptSend,
            payload,
            Parameters {
                queue: Some(format!("receipt:{recipient}")),
                constraints: vec![crate::constraints::ConstraintKey::Network],
                max_attempts: MaxAttempts::Limited(5),
                lifespan_ms: Some(24 * 60 * 60 * 1_000),
                ..Parameters::default()
            },
        )
    }
}

#[async_trait]
impl JobHandler for ReceiptSendJob {
    async fn run(&self, record: &mut JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let payload: ReceiptSendPayload = decode_payload(record)?;
        if payload.read && !ctx.config.read_receipts_enabled {
            return Ok(());
        }
        let kind = if payload.read {
            ReceiptKind::Read
        } else {
            ReceiptKind::Delivery
        };
        let outbound = OutboundPayload {
            timestamp_ms: now_ms(),
            content: OutboundContent::Receipt {
                kind,
                timestamps: payload.timestamps.clone(),
            },
        };
        let targets = vec![payload.recipient.clone()];
        let access = access_map(ctx, &targets).await?;
        let results = ctx.transport.send(&targets, &outbound, &access).await?;
        match results.first().map(|r| &r.outcome) {
            Some(SendOutcome::Success { .. }) => Ok(()),
            Some(SendOutcome::IdentityMismatch) => Ok(()),
            _ => Err(JobError::Transient("recipient unreachable".to_string())),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct GroupInfoRequestPayload {
    pub group_id: String,
    pub recipient: String,
}

/// Asks a group member for current group metadata after receiving a message
/// for a group this device does not know.
pub struct GroupInfoRequestJob;

impl GroupInfoRequestJob {
    pub fn record(group_id: &str, recipient: &str) -> JobRecord {
        let payload = serde_json::to_value(GroupInfoRequestPayload {
            group_id: group_id.to_string(),
            recipient: recipient.to_string(),
        })
        .unwrap_or_default();
        JobRecord::new(
            JobKind::GroupInfoRequest,
            payload,
            Parameters {
                queue: Some(format!("group:{group_id}")),
                constraints: vec![crate::constraints::ConstraintKey::Network],
                max_attempts: MaxAttempts::Limited(3),
                lifespan_ms: Some(24 * 60 * 60 * 1_000),
                ..Parameters::default()
            },
        )
    }
}

#[async_trait]
impl JobHandler for GroupInfoRequestJob {
    async fn run(&self, record: &mut JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let payload: GroupInfoRequestPayload = decode_payload(record)?;
        let outbound = OutboundPayload {
            timestamp_ms: now_ms(),
            content: OutboundContent::Data(DataMessage {
                group_context: Some(GroupContext {
                    group_id: payload.group_id.clone(),
                    kind: GroupContextKind::RequestInfo,
                }),
                ..DataMessage::default()
            }),
        };
        let targets = vec![payload.recipient.clone()];
        let access = access_map(ctx, &targets).await?;
        let results = ctx.transport.send(&targets, &outbound, &access).await?;
        match results.first().map(|r| &r.outcome) {
            Some(SendOutcome::Success { .. }) => Ok(()),
            Some(SendOutcome::IdentityMismatch) => Ok(()),
            _ => Err(JobError::Transient("recipient unreachable".to_string())),
        }
    }
}
