use std::time::Duration;
use thiserror::Error;
use voxlink_types::{ConnectionState, SessionError};

/// Failure reported by a [`Transport`](crate::Transport) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The server refused the token.
    #[error("transport rejected the credential: {0}")]
    Unauthorized(String),

    #[error("transport network failure: {0}")]
    Network(String),

    #[error("transport is not connected")]
    NotConnected,
}

impl TransportError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// Failure reported by the [`ConnectionManager`](crate::ConnectionManager).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("transport rejected the credential: {0}")]
    Auth(String),

    #[error("connection failed: {0}")]
    Network(String),

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("channel is not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("connection attempt cancelled by disconnect")]
    Cancelled,
}

impl ConnectionError {
    /// Bad credentials are fatal; retrying with the same token is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

impl From<TransportError> for ConnectionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized(reason) => Self::Auth(reason),
            TransportError::Network(reason) => Self::Network(reason),
            TransportError::NotConnected => Self::NotConnected(ConnectionState::Disconnected),
        }
    }
}

impl From<ConnectionError> for SessionError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Auth(_) => SessionError::Auth(err.to_string()),
            ConnectionError::Network(_) | ConnectionError::Timeout(_) => {
                SessionError::Network(err.to_string())
            }
            ConnectionError::NotConnected(_) => SessionError::ChannelUnavailable(err.to_string()),
            ConnectionError::Cancelled => SessionError::InvalidState(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxlink_types::ErrorCategory;

    #[test]
    fn maps_to_session_categories() {
        let auth: SessionError = ConnectionError::Auth("bad token".into()).into();
        assert_eq!(auth.category(), ErrorCategory::Auth);

        let timeout: SessionError = ConnectionError::Timeout(Duration::from_secs(1)).into();
        assert_eq!(timeout.category(), ErrorCategory::Network);

        let offline: SessionError =
            ConnectionError::NotConnected(ConnectionState::Reconnecting).into();
        assert_eq!(offline.category(), ErrorCategory::ChannelUnavailable);
    }

    #[test]
    fn only_auth_is_fatal() {
        assert!(ConnectionError::Auth("x".into()).is_fatal());
        assert!(!ConnectionError::Network("x".into()).is_fatal());
        assert!(TransportError::Unauthorized("x".into()).is_fatal());
        assert!(!TransportError::NotConnected.is_fatal());
    }
}
