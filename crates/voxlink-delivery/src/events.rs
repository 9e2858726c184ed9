use serde::Serialize;
use voxlink_types::{ChatMessage, DeliveryStatus, ErrorEvent};

/// Something the engine reports to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// A new chat message from the peer (never a duplicate).
    MessageReceived(ChatMessage),
    /// An outbound message changed status.
    StatusChanged {
        message_id: String,
        status: DeliveryStatus,
        attempts: u32,
        /// `true` for a failure that will not be retried.
        terminal: bool,
    },
    /// A participant started or stopped typing.
    TypingChanged { sender_id: String, is_typing: bool },
    /// A terminal error for one logical operation.
    Error(ErrorEvent),
}
