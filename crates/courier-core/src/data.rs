use crate::envelope::{AttachmentPointer, Envelope, ReactionContent};
use crate::error::CoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    Identity,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipientFailure {
    pub recipient: String,
    pub kind: FailureKind,
}

/// What a failed incoming message is recorded as, so the conversation shows
/// something actionable instead of silence.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PlaceholderKind {
    InvalidVersion,
    Corrupt,
    NoSession,
    Legacy,
    UnsupportedData,
    InvalidMessage,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub id: Uuid,
    pub group_id: String,
    pub body: Option<String>,
    pub attachments: Vec<AttachmentPointer>,
    pub timestamp_ms: u64,
    pub expires_in_secs: Option<u32>,
    pub is_view_once: bool,
    pub is_expiration_update: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum IncomingKind {
    Text,
    Media,
    GroupUpdate,
    ExpirationUpdate,
    EndSession,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncomingRecord {
    pub id: Uuid,
    pub sender: String,
    pub timestamp_ms: u64,
    pub kind: IncomingKind,
    pub body: Option<String>,
    pub attachments: Vec<AttachmentPointer>,
    pub group_id: Option<String>,
    pub expires_in_secs: Option<u32>,
}

/// Everything the pipelines persist about conversations, recipients, and
/// messages. The embedding application supplies the real implementation;
/// tests use [`InMemoryMessageStore`].
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn outgoing_message(&self, id: Uuid) -> Result<Option<OutgoingMessage>, CoreError>;
    async fn successful_recipients(&self, message_id: Uuid) -> Result<Vec<String>, CoreError>;
    async fn record_success(&self, message_id: Uuid, recipient: &str) -> Result<(), CoreError>;
    async fn failures(&self, message_id: Uuid) -> Result<Vec<RecipientFailure>, CoreError>;
    async fn add_failure(&self, message_id: Uuid, failure: RecipientFailure) -> Result<(), CoreError>;
    async fn remove_failure(&self, message_id: Uuid, recipient: &str) -> Result<(), CoreError>;
    async fn mark_sent(&self, message_id: Uuid) -> Result<(), CoreError>;
    async fn mark_send_failed(&self, message_id: Uuid) -> Result<(), CoreError>;
    async fn start_expiration(&self, message_id: Uuid) -> Result<(), CoreError>;
    async fn delete_view_once_payload(&self, message_id: Uuid) -> Result<(), CoreError>;

    async fn group_members(&self, group_id: &str) -> Result<Vec<String>, CoreError>;
    async fn is_group_known(&self, group_id: &str) -> Result<bool, CoreError>;

    async fn insert_incoming(&self, record: IncomingRecord) -> Result<(), CoreError>;
    async fn insert_placeholder(
        &self,
        sender: &str,
        timestamp_ms: u64,
        kind: PlaceholderKind,
    ) -> Result<(), CoreError>;

    async fn apply_reaction(
        &self,
        author: &str,
        target_author: &str,
        target_timestamp_ms: u64,
        reaction: &ReactionContent,
    ) -> Result<(), CoreError>;
    async fn reaction(&self, message_id: Uuid, author: &str) -> Result<Option<String>, CoreError>;
    async fn add_reaction(&self, message_id: Uuid, author: &str, emoji: &str) -> Result<(), CoreError>;
    async fn delete_reaction(&self, message_id: Uuid, author: &str) -> Result<(), CoreError>;

    async fn profile_key(&self, recipient: &str) -> Result<Option<Vec<u8>>, CoreError>;
    async fn set_profile_key(&self, recipient: &str, key: Vec<u8>) -> Result<(), CoreError>;
    async fn invalidate_unidentified_access(&self, recipient: &str) -> Result<(), CoreError>;
    async fn clear_force_fallback(&self, recipient: &str) -> Result<(), CoreError>;
    async fn unidentified_access(&self, recipient: &str) -> Result<Option<Vec<u8>>, CoreError>;

    async fn apply_receipt(
        &self,
        sender: &str,
        timestamp_ms: u64,
        read: bool,
    ) -> Result<(), CoreError>;
    async fn apply_sync_sent(&self, destination: &str, timestamp_ms: u64) -> Result<(), CoreError>;
    async fn apply_sync_read(&self, sender: &str, timestamp_ms: u64) -> Result<(), CoreError>;

    async fn set_conversation_expiration(
        &self,
        conversation: &str,
        expires_in_secs: Option<u32>,
    ) -> Result<(), CoreError>;
    async fn end_session(&self, peer: &str) -> Result<(), CoreError>;

    async fn attachment_data(&self, message_id: Uuid, index: usize) -> Result<Vec<u8>, CoreError>;
    async fn set_attachment_remote(
        &self,
        message_id: Uuid,
        index: usize,
        remote_id: String,
    ) -> Result<(), CoreError>;
}

#[derive(Default)]
pub struct InMemoryMessageState {
    pub outgoing: HashMap<Uuid, OutgoingMessage>,
    pub successes: HashMap<Uuid, HashSet<String>>,
    pub failures: HashMap<Uuid, Vec<RecipientFailure>>,
    pub sent: HashSet<Uuid>,
    pub send_failed: HashSet<Uuid>,
    pub expiration_started: HashSet<Uuid>,
    pub view_once_deleted: HashSet<Uuid>,
    pub groups: HashMap<String, Vec<String>>,
    pub incoming: Vec<IncomingRecord>,
    pub placeholders: Vec<(String, u64, PlaceholderKind)>,
    pub inbound_reactions: Vec<(String, String, u64, ReactionContent)>,
    pub reactions: HashMap<(Uuid, String), String>,
    pub profile_keys: HashMap<String, Vec<u8>>,
    pub unidentified_access: HashMap<String, Vec<u8>>,
    pub invalidated_access: HashSet<String>,
    pub cleared_fallback: HashSet<String>,
    pub receipts: Vec<(String, u64, bool)>,
    pub sync_sent: Vec<(String, u64)>,
    pub sync_read: Vec<(String, u64)>,
    pub conversation_expirations: HashMap<String, Option<u32>>,
    pub ended_sessions: Vec<String>,
    pub attachment_payloads: HashMap<(Uuid, usize), Vec<u8>>,
    pub attachment_remotes: HashMap<(Uuid, usize), String>,
}

#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    pub state: Arc<Mutex<InMemoryMessageState>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_outgoing(&self, message: OutgoingMessage) {
        self.state.lock().await.outgoing.insert(message.id, message);
    }

    pub async fn set_group(&self, group_id: &str, members: Vec<String>) {
        self.state
            .lock()
            .await
            .groups
            .insert(group_id.to_string(), members);
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn outgoing_message(&self, id: Uuid) -> Result<Option<OutgoingMessage>, CoreError> {
        Ok(self.state.lock().await.outgoing.get(&id).cloned())
    }

    async fn successful_recipients(&self, message_id: Uuid) -> Result<Vec<String>, CoreError> {
        Ok(self
            .state
            .lock()
            .await
            .successes
            .get(&message_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn record_success(&self, message_id: Uuid, recipient: &str) -> Result<(), CoreError> {
        self.state
            .lock()
            .await
            .successes
            .entry(message_id)
            .or_default()
            .insert(recipient.to_string());
        Ok(())
    }

    async fn failures(&self, message_id: Uuid) -> Result<Vec<RecipientFailure>, CoreError> {
        Ok(self
            .state
            .lock()
            .await
            .failures
            .get(&message_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_failure(&self, message_id: Uuid, failure: RecipientFailure) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        let entries = state.failures.entry(message_id).or_default();
        entries.retain(|f| f.recipient != failure.recipient);
        entries.push(failure);
        Ok(())
    }

    async fn remove_failure(&self, message_id: Uuid, recipient: &str) -> Result<(), CoreError> {
        if let Some(entries) = self.state.lock().await.failures.get_mut(&message_id) {
            entries.retain(|f| f.recipient != recipient);
        }
        Ok(())
    }

    async fn mark_sent(&self, message_id: Uuid) -> Result<(), CoreError> {
        self.state.lock().await.sent.insert(message_id);
        Ok(())
    }

    async fn mark_send_failed(&self, message_id: Uuid) -> Result<(), CoreError> {
        self.state.lock().await.send_failed.insert(message_id);
        Ok(())
    }

    async fn start_expiration(&self, message_id: Uuid) -> Result<(), CoreError> {
        self.state.lock().await.expiration_started.insert(message_id);
        Ok(())
    }

    async fn delete_view_once_payload(&self, message_id: Uuid) -> Result<(), CoreError> {
        self.state.lock().await.view_once_deleted.insert(message_id);
        Ok(())
    }

    async fn group_members(&self, group_id: &str) -> Result<Vec<String>, CoreError> {
        Ok(self
            .state
            .lock()
            .await
            .groups
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn is_group_known(&self, group_id: &str) -> Result<bool, CoreError> {
        Ok(self.state.lock().await.groups.contains_key(group_id))
    }

    async fn insert_incoming(&self, record: IncomingRecord) -> Result<(), CoreError> {
        self.state.lock().await.incoming.push(record);
        Ok(())
    }

    async fn insert_placeholder(
        &self,
        sender: &str,
        timestamp_ms: u64,
        kind: PlaceholderKind,
    ) -> Result<(), CoreError> {
        self.state
            .lock()
            .await
            .placeholders
            .push((sender.to_string(), timestamp_ms, kind));
        Ok(())
    }

    async fn apply_reaction(
        &self,
        author: &str,
        target_author: &str,
        target_timestamp_ms: u64,
        reaction: &ReactionContent,
    ) -> Result<(), CoreError> {
        self.state.lock().await.inbound_reactions.push((
            author.to_string(),
            target_author.to_string(),
            target_timestamp_ms,
            reaction.clone(),
        ));
        Ok(())
    }

    async fn reaction(&self, message_id: Uuid, author: &str) -> Result<Option<String>, CoreError> {
        Ok(self
            .state
            .lock()
            .await
            .reactions
            .get(&(message_id, author.to_string()))
            .cloned())
    }

    async fn add_reaction(&self, message_id: Uuid, author: &str, emoji: &str) -> Result<(), CoreError> {
        self.state
            .lock()
            .await
            .reactions
            .insert((message_id, author.to_string()), emoji.to_string());
        Ok(())
    }

    async fn delete_reaction(&self, message_id: Uuid, author: &str) -> Result<(), CoreError> {
        self.state
            .lock()
            .await
            .reactions
            .remove(&(message_id, author.to_string()));
        Ok(())
    }

    async fn profile_key(&self, recipient: &str) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.state.lock().await.profile_keys.get(recipient).cloned())
    }

    async fn set_profile_key(&self, recipient: &str, key: Vec<u8>) -> Result<(), CoreError> {
        self.state
            .lock()
            .await
            .profile_keys
            .insert(recipient.to_string(), key);
        Ok(())
    }

    async fn invalidate_unidentified_access(&self, recipient: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        state.unidentified_access.remove(recipient);
        state.invalidated_access.insert(recipient.to_string());
        Ok(())
    }

    async fn clear_force_fallback(&self, recipient: &str) -> Result<(), CoreError> {
        self.state
            .lock()
            .await
            .cleared_fallback
            .insert(recipient.to_string());
        Ok(())
    }

    async fn unidentified_access(&self, recipient: &str) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self
            .state
            .lock()
            .await
            .unidentified_access
            .get(recipient)
            .cloned())
    }

    async fn apply_receipt(
        &self,
        sender: &str,
        timestamp_ms: u64,
        read: bool,
    ) -> Result<(), CoreError> {
        self.state
            .lock()
            .await
            .receipts
            .push((sender.to_string(), timestamp_ms, read));
        Ok(())
    }

    async fn apply_sync_sent(&self, destination: &str, timestamp_ms: u64) -> Result<(), CoreError> {
        self.state
            .lock()
            .await
            .sync_sent
            .push((destination.to_string(), timestamp_ms));
        Ok(())
    }

    async fn apply_sync_read(&self, sender: &str, timestamp_ms: u64) -> Result<(), CoreError> {
        self.state
            .lock()
            .await
            .sync_read
            .push((sender.to_string(), timestamp_ms));
        Ok(())
    }

    async fn set_conversation_expiration(
        &self,
        conversation: &str,
        expires_in_secs: Option<u32>,
    ) -> Result<(), CoreError> {
        self.state
            .lock()
            .await
            .conversation_expirations
            .insert(conversation.to_string(), expires_in_secs);
        Ok(())
    }

    async fn end_session(&self, peer: &str) -> Result<(), CoreError> {
        self.state.lock().await.ended_sessions.push(peer.to_string());
        Ok(())
    }

    async fn attachment_data(&self, message_id: Uuid, index: usize) -> Result<Vec<u8>, CoreError> {
        self.state
            .lock()
            .await
            .attachment_payloads
            .get(&(message_id, index))
            .cloned()
            .ok_or(CoreError::NotFound)
    }

    async fn set_attachment_remote(
        &self,
        message_id: Uuid,
        index: usize,
        remote_id: String,
    ) -> Result<(), CoreError> {
        self.state
            .lock()
            .await
            .attachment_remotes
            .insert((message_id, index), remote_id);
        Ok(())
    }
}

/// Holds incoming ciphertexts until the processing job finishes with them.
#[async_trait]
pub trait EnvelopeStore: Send + Sync {
    async fn put(&self, envelope: Envelope) -> Result<(), CoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<Envelope>, CoreError>;
    async fn delete(&self, id: Uuid) -> Result<(), CoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryEnvelopeStore {
    envelopes: Arc<Mutex<HashMap<Uuid, Envelope>>>,
}

impl InMemoryEnvelopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.envelopes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.envelopes.lock().await.is_empty()
    }
}

#[async_trait]
impl EnvelopeStore for InMemoryEnvelopeStore {
    async fn put(&self, envelope: Envelope) -> Result<(), CoreError> {
        self.envelopes.lock().await.insert(envelope.id, envelope);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Envelope>, CoreError> {
        Ok(self.envelopes.lock().await.get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<(), CoreError> {
        self.envelopes.lock().await.remove(&id);
        Ok(())
    }
}
