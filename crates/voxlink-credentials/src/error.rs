use thiserror::Error;
use voxlink_types::SessionError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// The endpoint refused the participant (401/403). Never retried.
    #[error("credential endpoint rejected the request (HTTP {status})")]
    Unauthorized { status: u16 },

    /// Any other non-success HTTP status.
    #[error("credential endpoint returned HTTP {status}")]
    Http { status: u16 },

    /// The request could not be completed (timeout, refused, DNS).
    #[error("credential request failed: {0}")]
    Request(String),

    /// The response body did not match the expected shape.
    #[error("invalid credential response: {0}")]
    Decode(String),

    /// Transient failures persisted through every attempt.
    #[error("credential request gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl CredentialError {
    /// Fatal errors abort immediately; everything else is transient.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::Exhausted { .. })
    }
}

impl From<CredentialError> for SessionError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Unauthorized { .. } => SessionError::Auth(err.to_string()),
            _ => SessionError::Network(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxlink_types::ErrorCategory;

    #[test]
    fn unauthorized_maps_to_auth_category() {
        let err: SessionError = CredentialError::Unauthorized { status: 403 }.into();
        assert_eq!(err.category(), ErrorCategory::Auth);
    }

    #[test]
    fn transient_failures_map_to_network_category() {
        let err: SessionError = CredentialError::Http { status: 503 }.into();
        assert_eq!(err.category(), ErrorCategory::Network);
        assert!(!CredentialError::Request("refused".into()).is_fatal());
        assert!(CredentialError::Unauthorized { status: 401 }.is_fatal());
    }
}
