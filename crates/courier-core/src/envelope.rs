use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An incoming ciphertext as pulled off the wire, persisted until the
/// processing job reaches a terminal outcome for it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub id: Uuid,
    pub sender: String,
    pub sender_device: u32,
    pub timestamp_ms: u64,
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn new(sender: &str, sender_device: u32, timestamp_ms: u64, ciphertext: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.to_string(),
            sender_device,
            timestamp_ms,
            ciphertext,
        }
    }
}

/// Plaintext content recovered from an envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Content {
    Data(DataMessage),
    Sync(SyncMessage),
    Receipt(ReceiptMessage),
    Typing(TypingMessage),
    Call(CallMessage),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataMessage {
    pub body: Option<String>,
    pub attachments: Vec<AttachmentPointer>,
    pub group_context: Option<GroupContext>,
    pub expires_in_secs: Option<u32>,
    pub is_end_session: bool,
    pub is_expiration_update: bool,
    pub is_view_once: bool,
    pub profile_key: Option<Vec<u8>>,
    pub reaction: Option<ReactionContent>,
    pub requests_receipt: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentPointer {
    pub remote_id: String,
    pub content_type: String,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupContext {
    pub group_id: String,
    pub kind: GroupContextKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupContextKind {
    Deliver,
    Update,
    Quit,
    RequestInfo,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactionContent {
    pub emoji: String,
    pub remove: bool,
    pub target_author: String,
    pub target_timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiptMessage {
    pub kind: ReceiptKind,
    pub timestamps: Vec<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiptKind {
    Delivery,
    Read,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypingMessage {
    pub started: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallMessage {
    pub payload: Vec<u8>,
}

/// Multi-device transcript sent by another device of the local user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncMessage {
    Sent {
        destination: String,
        timestamp_ms: u64,
        message: DataMessage,
    },
    Read {
        sender: String,
        timestamp_ms: u64,
    },
}
