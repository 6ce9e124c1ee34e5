use tokio::sync::broadcast;
use uuid::Uuid;

/// Notifications surfaced to the embedding application. Fire-and-forget;
/// slow subscribers are allowed to lag and miss events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoreEvent {
    MessageSent { message_id: Uuid },
    MessageFailed { message_id: Uuid },
    SafetyNumberChange { message_id: Uuid, recipients: Vec<String> },
    MessageArrived { message_id: Uuid, sender: String },
    DecryptFailure { sender: String },
    Typing { sender: String, started: bool },
    CallSignal { sender: String },
    BackupProgress { frames: usize },
    BackupFinished { path: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Emits the event, dropping it when no subscriber is attached.
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
