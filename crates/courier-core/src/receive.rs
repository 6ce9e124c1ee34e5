use crate::data::{IncomingKind, IncomingRecord, PlaceholderKind};
use crate::envelope::{Content, DataMessage, Envelope, GroupContextKind, ReceiptKind, SyncMessage};
use crate::error::{DecryptError, JobError};
use crate::events::CoreEvent;
use crate::job::{JobContext, JobHandler, JobKind, JobRecord, Parameters};
use crate::send::{GroupInfoRequestJob, ReceiptSendJob};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Serialize, Deserialize)]
pub struct ProcessEnvelopePayload {
    pub envelope_id: Uuid,
}

/// Decrypts and applies one stored envelope. Every outcome is terminal for
/// the envelope except a pending store migration, which leaves it in place
/// for a later attempt.
pub struct ProcessEnvelopeJob;

impl ProcessEnvelopeJob {
    pub fn record(envelope: &Envelope) -> JobRecord {
        let payload = serde_json::to_value(ProcessEnvelopePayload {
            envelope_id: envelope.id,
        })
        .unwrap_or_default();
        JobRecord::new(
            JobKind::ProcessEnvelope,
            payload,
            Parameters {
                queue: Some(format!("process:{}", envelope.sender)),
                ..Parameters::default()
            },
        )
    }

    async fn apply_data(
        &self,
        envelope: &Envelope,
        data: &DataMessage,
        ctx: &JobContext,
    ) -> Result<(), JobError> {
        let store = JobError::Transient("store".to_string());
        // A sender that reached us through an established session is no
        // longer forced onto the fallback path.
        ctx.messages
            .clear_force_fallback(&envelope.sender)
            .await
            .map_err(|_| store.clone())?;
        if let Some(key) = &data.profile_key {
            let known = ctx
                .messages
                .profile_key(&envelope.sender)
                .await
                .map_err(|_| store.clone())?;
            if known.as_deref() != Some(key.as_slice()) {
                ctx.messages
                    .set_profile_key(&envelope.sender, key.clone())
                    .await
                    .map_err(|_| store.clone())?;
                ctx.messages
                    .invalidate_unidentified_access(&envelope.sender)
                    .await
                    .map_err(|_| store.clone())?;
            }
        }

        let group_id = data.group_context.as_ref().map(|gc| gc.group_id.clone());
        if let Some(gc) = &data.group_context {
            if gc.kind != GroupContextKind::Update
                && !ctx
                    .messages
                    .is_group_known(&gc.group_id)
                    .await
                    .map_err(|_| store.clone())?
            {
                info!(group = %gc.group_id, sender = %envelope.sender, "message for unknown group, requesting info");
                ctx.enqueuer
                    .enqueue(GroupInfoRequestJob::record(&gc.group_id, &envelope.sender))
                    .await
                    .map_err(|_| store.clone())?;
                return Ok(());
            }
        }

        if data.is_view_once && data.attachments.is_empty() {
            warn!(sender = %envelope.sender, "view-once message without media");
            ctx.messages
                .insert_placeholder(
                    &envelope.sender,
                    envelope.timestamp_ms,
                    PlaceholderKind::InvalidMessage,
                )
                .await
                .map_err(|_| store.clone())?;
            return Ok(());
        }
        if data.is_end_session {
            ctx.messages
                .end_session(&envelope.sender)
                .await
                .map_err(|_| store.clone())?;
            self.insert(envelope, data, IncomingKind::EndSession, group_id, ctx)
                .await?;
            return Ok(());
        }
        if matches!(
            data.group_context.as_ref().map(|gc| gc.kind),
            Some(GroupContextKind::Update) | Some(GroupContextKind::Quit)
        ) {
            self.insert(envelope, data, IncomingKind::GroupUpdate, group_id, ctx)
                .await?;
            return Ok(());
        }
        if data.is_expiration_update {
            let conversation = group_id.clone().unwrap_or_else(|| envelope.sender.clone());
            ctx.messages
                .set_conversation_expiration(&conversation, data.expires_in_secs)
                .await
                .map_err(|_| store.clone())?;
            self.insert(envelope, data, IncomingKind::ExpirationUpdate, group_id, ctx)
                .await?;
            return Ok(());
        }
        if let Some(reaction) = &data.reaction {
            ctx.messages
                .apply_reaction(
                    &envelope.sender,
                    &reaction.target_author,
                    reaction.target_timestamp_ms,
                    reaction,
                )
                .await
                .map_err(|_| store.clone())?;
            return Ok(());
        }
        let kind = if data.attachments.is_empty() {
            IncomingKind::Text
        } else {
            IncomingKind::Media
        };
        self.insert(envelope, data, kind, group_id, ctx).await?;
        if data.requests_receipt {
            ctx.enqueuer
                .enqueue(ReceiptSendJob::record(
                    &envelope.sender,
                    false,
                    vec![envelope.timestamp_ms],
                ))
                .await
                .map_err(|_| store.clone())?;
        }
        Ok(())
    }

    async fn insert(
        &self,
        envelope: &Envelope,
        data: &DataMessage,
        kind: IncomingKind,
        group_id: Option<String>,
        ctx: &JobContext,
    ) -> Result<(), JobError> {
        let record = IncomingRecord {
            id: Uuid::new_v4(),
            sender: envelope.sender.clone(),
            timestamp_ms: envelope.timestamp_ms,
            kind,
            body: data.body.clone(),
            attachments: data.attachments.clone(),
            group_id,
            expires_in_secs: data.expires_in_secs,
        };
        let id = record.id;
        ctx.messages
            .insert_incoming(record)
            .await
            .map_err(|_| JobError::Transient("store".to_string()))?;
        ctx.events.emit(CoreEvent::MessageArrived {
            message_id: id,
            sender: envelope.sender.clone(),
        });
        Ok(())
    }

    async fn record_failure(
        &self,
        envelope: &Envelope,
        error: DecryptError,
        ctx: &JobContext,
    ) -> Result<(), JobError> {
        let placeholder = match error {
            DecryptError::InvalidVersion => Some(PlaceholderKind::InvalidVersion),
            DecryptError::Corrupt => Some(PlaceholderKind::Corrupt),
            DecryptError::NoSession => Some(PlaceholderKind::NoSession),
            DecryptError::Legacy => Some(PlaceholderKind::Legacy),
            DecryptError::Unsupported => Some(PlaceholderKind::UnsupportedData),
            // Retransmits and own sync leakage leave no trace.
            DecryptError::Duplicate | DecryptError::SelfSend => None,
        };
        let Some(kind) = placeholder else {
            debug!(sender = %envelope.sender, error = %error, "envelope dropped silently");
            return Ok(());
        };
        warn!(sender = %envelope.sender, error = %error, "envelope failed to decrypt");
        ctx.messages
            .insert_placeholder(&envelope.sender, envelope.timestamp_ms, kind)
            .await
            .map_err(|_| JobError::Transient("store".to_string()))?;
        ctx.events.emit(CoreEvent::DecryptFailure {
            sender: envelope.sender.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl JobHandler for ProcessEnvelopeJob {
    async fn run(&self, record: &mut JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.state.snapshot().migrations_pending {
            // The envelope stays stored; this attempt costs nothing.
            return Err(JobError::Precondition("store migration pending".to_string()));
        }
        let payload: ProcessEnvelopePayload =
            serde_json::from_value(record.payload.clone())
                .map_err(|err| JobError::Fatal(format!("payload: {err}")))?;
        let store = JobError::Transient("store".to_string());
        let Some(envelope) = ctx
            .envelopes
            .get(payload.envelope_id)
            .await
            .map_err(|_| store.clone())?
        else {
            return Ok(());
        };
        match ctx.transport.decrypt(&envelope).await {
            Ok(Content::Data(data)) => self.apply_data(&envelope, &data, ctx).await?,
            Ok(Content::Receipt(receipt)) => {
                let read = receipt.kind == ReceiptKind::Read;
                for timestamp in receipt.timestamps {
                    ctx.messages
                        .apply_receipt(&envelope.sender, timestamp, read)
                        .await
                        .map_err(|_| store.clone())?;
                }
            }
            Ok(Content::Typing(typing)) => {
                ctx.events.emit(CoreEvent::Typing {
                    sender: envelope.sender.clone(),
                    started: typing.started,
                });
            }
            Ok(Content::Call(_)) => {
                ctx.events.emit(CoreEvent::CallSignal {
                    sender: envelope.sender.clone(),
                });
            }
            Ok(Content::Sync(SyncMessage::Sent {
                destination,
                timestamp_ms,
                ..
            })) => {
                ctx.messages
                    .apply_sync_sent(&destination, timestamp_ms)
                    .await
                    .map_err(|_| store.clone())?;
            }
            Ok(Content::Sync(SyncMessage::Read {
                sender,
                timestamp_ms,
            })) => {
                ctx.messages
                    .apply_sync_read(&sender, timestamp_ms)
                    .await
                    .map_err(|_| store.clone())?;
            }
            Err(error) => self.record_failure(&envelope, error, ctx).await?,
        }
        ctx.envelopes
            .delete(envelope.id)
            .await
            .map_err(|_| store)?;
        Ok(())
    }
}
