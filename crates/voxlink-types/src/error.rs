//! Session error taxonomy.

use serde::{Deserialize, Serialize};

use crate::wire::FrameError;

/// Stable error category surfaced to presentation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The credential endpoint or transport rejected the participant.
    Auth,
    /// Timeout, refused connection, or other transient transport failure.
    Network,
    /// Malformed inbound payload or rejected outbound input.
    Validation,
    /// A send was attempted while the channel was not connected.
    ChannelUnavailable,
    /// A message failed after its full attempt budget.
    DeliveryExhausted,
    /// Invalid local configuration.
    Config,
    /// An operation was issued in a state that does not allow it.
    InvalidState,
}

impl ErrorCategory {
    /// Returns the stable machine-readable code for this category.
    pub fn code(self) -> &'static str {
        match self {
            Self::Auth => "auth_error",
            Self::Network => "network_error",
            Self::Validation => "validation_error",
            Self::ChannelUnavailable => "channel_unavailable",
            Self::DeliveryExhausted => "delivery_exhausted",
            Self::Config => "config_error",
            Self::InvalidState => "invalid_state",
        }
    }

    /// Returns whether errors of this category are retried internally.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::ChannelUnavailable)
    }
}

/// Categorised session-level error.
///
/// Messages carry only the context needed for a user-facing description;
/// tokens and payload bodies are never included.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("authorization rejected: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("message {message_id} was not delivered after {attempts} attempts")]
    DeliveryExhausted { message_id: String, attempts: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid session state: {0}")]
    InvalidState(String),
}

impl SessionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Auth(_) => ErrorCategory::Auth,
            Self::Network(_) => ErrorCategory::Network,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::ChannelUnavailable(_) => ErrorCategory::ChannelUnavailable,
            Self::DeliveryExhausted { .. } => ErrorCategory::DeliveryExhausted,
            Self::Config(_) => ErrorCategory::Config,
            Self::InvalidState(_) => ErrorCategory::InvalidState,
        }
    }
}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// An error published on the session error stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub category: ErrorCategory,
    pub message: String,
    /// The chat message the error concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Epoch milliseconds at which the error was surfaced.
    pub ts: i64,
}

impl ErrorEvent {
    pub fn new(error: &SessionError, ts: i64) -> Self {
        let message_id = match error {
            SessionError::DeliveryExhausted { message_id, .. } => Some(message_id.clone()),
            _ => None,
        };
        Self {
            category: error.category(),
            message: error.to_string(),
            message_id,
            ts,
        }
    }
}
