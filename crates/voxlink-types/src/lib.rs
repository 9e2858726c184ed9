//! Shared types, wire format, and error taxonomy for voxlink sessions.
//!
//! This crate provides the data model used by every other voxlink crate:
//! chat messages, connection and delivery states, session credentials, the
//! data-channel wire codec, and the categorised session error type.
//!
//! It carries no async runtime dependency so it can be shared by the
//! presentation layer as well as the session core.

pub mod error;
pub mod wire;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use error::{ErrorCategory, ErrorEvent, SessionError};
pub use wire::{decode_frame, ControlFrame, FrameError, WireFrame};

/// A chat message exchanged with the remote peer.
///
/// Immutable once constructed; identity is `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Globally unique message identifier.
    pub id: String,
    /// Identity of the participant that authored the message.
    pub sender_id: String,
    /// Optional display name of the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Message body. Never empty.
    pub text: String,
    /// Creation time in epoch milliseconds.
    pub ts: i64,
}

/// Lifecycle state of the transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Returns whether the edge `self -> next` is a legal transition.
    ///
    /// Every state may move to `Disconnected` (explicit disconnect, exhausted
    /// reconnection budget, or a transport-reported close).
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disconnected | Failed, Connecting)
                | (Connecting, Connected | Failed)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Connecting | Connected | Reconnecting | Failed, Disconnected)
        )
    }

    /// Returns the lowercase label for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of an outbound chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for its first delivery attempt.
    Pending,
    /// Handed to the channel; awaiting a receipt or the confirmation window.
    Sent,
    /// Acknowledged by the peer, or promoted after the confirmation window.
    Delivered,
    /// The last attempt failed. Terminal once the attempt budget is spent.
    Failed,
}

/// A short-lived access credential for opening a transport session.
///
/// Replaced wholesale on refresh and never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Opaque participant token.
    pub value: String,
    /// Expiry in epoch milliseconds, if the issuer reported one.
    pub expires_at_ms: Option<i64>,
    /// URL of the real-time server the token is valid for.
    pub server_url: String,
    /// Room the token grants access to.
    pub room_name: String,
    /// Participant name assigned by the issuer.
    pub participant_name: String,
}

impl Credential {
    /// Returns whether the credential can still be used at `now_ms` without
    /// dipping into the refresh buffer.
    ///
    /// A credential without a known expiry is always fresh.
    pub fn is_fresh(&self, now_ms: i64, refresh_buffer_ms: i64) -> bool {
        match self.expires_at_ms {
            Some(expires_at) => now_ms < expires_at.saturating_sub(refresh_buffer_ms),
            None => true,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("value", &"[REDACTED]")
            .field("expires_at_ms", &self.expires_at_ms)
            .field("server_url", &self.server_url)
            .field("room_name", &self.room_name)
            .field("participant_name", &self.participant_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(expires_at_ms: Option<i64>) -> Credential {
        Credential {
            value: "secret-token".to_string(),
            expires_at_ms,
            server_url: "wss://rtc.example.org".to_string(),
            room_name: "room-1".to_string(),
            participant_name: "alice".to_string(),
        }
    }

    #[test]
    fn legal_connection_transitions() {
        use ConnectionState::*;

        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Failed));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
        assert!(Reconnecting.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Failed.can_transition_to(Connecting));
    }

    #[test]
    fn illegal_connection_transitions() {
        use ConnectionState::*;

        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Reconnecting));
        assert!(!Connecting.can_transition_to(Reconnecting));
        assert!(!Failed.can_transition_to(Connected));
        assert!(!Reconnecting.can_transition_to(Failed));
        assert!(!Connected.can_transition_to(Connected));
    }

    #[test]
    fn credential_freshness_respects_refresh_buffer() {
        let cred = credential(Some(1_000_000));
        assert!(cred.is_fresh(1_000_000 - 61_000, 60_000));
        assert!(!cred.is_fresh(1_000_000 - 59_000, 60_000));
        assert!(!cred.is_fresh(1_000_000 - 60_000, 60_000));
    }

    #[test]
    fn credential_without_expiry_is_always_fresh() {
        assert!(credential(None).is_fresh(i64::MAX, 60_000));
    }

    #[test]
    fn credential_debug_redacts_token() {
        let rendered = format!("{:?}", credential(None));
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn chat_message_uses_camel_case_fields() {
        let msg = ChatMessage {
            id: "m1".to_string(),
            sender_id: "alice".to_string(),
            sender_name: None,
            text: "hi".to_string(),
            ts: 42,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["senderId"], "alice");
        assert!(json.get("senderName").is_none());
    }
}
