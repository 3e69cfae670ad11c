use crate::message::{Message, MessageError, Part};
use crate::session::Session;
use serde_json::Value;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub enum BusEvent {
    /// `session.updated`
    SessionUpdated { info: Session },
    /// `session.error`
    SessionError {
        session_id: Option<String>,
        error: MessageError,
    },
    /// `message.updated`
    MessageUpdated { info: Message },
    /// `message.partUpdated`
    MessagePartUpdated {
        part: Part,
        message_id: String,
        session_id: String,
    },
    /// `storage.write`
    StorageWrite { key: Vec<String>, content: Value },
}

impl BusEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BusEvent::SessionUpdated { .. } => "session.updated",
            BusEvent::SessionError { .. } => "session.error",
            BusEvent::MessageUpdated { .. } => "message.updated",
            BusEvent::MessagePartUpdated { .. } => "message.partUpdated",
            BusEvent::StorageWrite { .. } => "storage.write",
        }
    }
}

/// Broadcast bus for live observers. Cloning shares the channel.
#[derive(Clone)]
pub struct Bus {
    sender: broadcast::Sender<BusEvent>,
}

impl Bus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Bus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: BusEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
