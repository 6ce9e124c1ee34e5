use crate::envelope::{Content, DataMessage, Envelope, ReceiptKind, TypingMessage};
use crate::error::{DecryptError, JobError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Per-recipient outcome of a network send. A single call can succeed for
/// some recipients and fail for others; the caller reconciles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Success { unidentified: bool },
    IdentityMismatch,
    NetworkFailure,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecipientSendResult {
    pub recipient: String,
    pub outcome: SendOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundContent {
    Data(DataMessage),
    Receipt { kind: ReceiptKind, timestamps: Vec<u64> },
    Typing(TypingMessage),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundPayload {
    pub timestamp_ms: u64,
    pub content: OutboundContent,
}

/// Location of an uploaded attachment on the server.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteAttachment {
    pub remote_id: String,
    pub digest: Vec<u8>,
}

/// Network and session-crypto seam. The scheduler and pipelines never talk
/// to the wire directly; tests script this trait instead.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attempts delivery to every listed recipient, returning one result per
    /// recipient. `Err` is reserved for failures that prevented the attempt
    /// entirely (e.g. no connectivity at all).
    async fn send(
        &self,
        recipients: &[String],
        payload: &OutboundPayload,
        unidentified_access: &HashMap<String, Vec<u8>>,
    ) -> Result<Vec<RecipientSendResult>, JobError>;

    /// Decrypts an incoming envelope through the session layer.
    async fn decrypt(&self, envelope: &Envelope) -> Result<Content, DecryptError>;

    async fn upload_attachment(&self, data: &[u8]) -> Result<RemoteAttachment, JobError>;
}

#[derive(Default)]
struct MockTransportState {
    // Scripted outcomes, popped front-first per recipient. Empty queue
    // means plain success.
    outcomes: HashMap<String, Vec<SendOutcome>>,
    sent: Vec<(Vec<String>, OutboundPayload)>,
    decrypt_results: HashMap<Uuid, Result<Content, DecryptError>>,
    upload_failures: usize,
}

/// In-memory transport for tests.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockTransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn script_outcome(&self, recipient: &str, outcome: SendOutcome) {
        self.state
            .lock()
            .await
            .outcomes
            .entry(recipient.to_string())
            .or_default()
            .push(outcome);
    }

    pub async fn script_decrypt(&self, envelope_id: Uuid, result: Result<Content, DecryptError>) {
        self.state.lock().await.decrypt_results.insert(envelope_id, result);
    }

    /// The next `count` uploads fail with a transient error.
    pub async fn fail_uploads(&self, count: usize) {
        self.state.lock().await.upload_failures = count;
    }

    pub async fn sent_payloads(&self) -> Vec<(Vec<String>, OutboundPayload)> {
        self.state.lock().await.sent.clone()
    }

    pub async fn send_count_for(&self, recipient: &str) -> usize {
        self.state
            .lock()
            .await
            .sent
            .iter()
            .filter(|(recipients, _)| recipients.iter().any(|r| r == recipient))
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        recipients: &[String],
        payload: &OutboundPayload,
        _unidentified_access: &HashMap<String, Vec<u8>>,
    ) -> Result<Vec<RecipientSendResult>, JobError> {
        let mut state = self.state.lock().await;
        state.sent.push((recipients.to_vec(), payload.clone()));
        let mut results = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let outcome = state
                .outcomes
                .get_mut(recipient)
                .and_then(|queue| {
                    if queue.is_empty() {
                        None
                    } else {
                        Some(queue.remove(0))
                    }
                })
                .unwrap_or(SendOutcome::Success { unidentified: false });
            results.push(RecipientSendResult {
                recipient: recipient.clone(),
                outcome,
            });
        }
        Ok(results)
    }

    async fn decrypt(&self, envelope: &Envelope) -> Result<Content, DecryptError> {
        self.state
            .lock()
            .await
            .decrypt_results
            .remove(&envelope.id)
            .unwrap_or(Err(DecryptError::Corrupt))
    }

    async fn upload_attachment(&self, data: &[u8]) -> Result<RemoteAttachment, JobError> {
        let mut state = self.state.lock().await;
        if state.upload_failures > 0 {
            state.upload_failures -= 1;
            return Err(JobError::Transient("upload".to_string()));
        }
        Ok(RemoteAttachment {
            remote_id: Uuid::new_v4().to_string(),
            digest: data.iter().take(8).copied().collect(),
        })
    }
}
