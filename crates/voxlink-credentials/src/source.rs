use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use voxlink_types::Credential;

use crate::config::CredentialSettings;
use crate::error::CredentialError;

/// Query parameters forwarded to the token endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialOptions {
    pub provider: Option<String>,
    pub voice_id: Option<String>,
}

impl CredentialOptions {
    pub fn from_settings(settings: &CredentialSettings) -> Self {
        Self {
            provider: settings.provider.clone(),
            voice_id: settings.voice_id.clone(),
        }
    }
}

/// Something that can issue a participant credential.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Performs one fetch. Retrying is the caller's job.
    async fn fetch(
        &self,
        user_id: &str,
        options: &CredentialOptions,
    ) -> Result<Credential, CredentialError>;
}

/// `expires_at` may be epoch seconds or an RFC 3339 timestamp.
#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiresAt {
    EpochSeconds(i64),
    Timestamp(String),
}

impl ExpiresAt {
    fn into_millis(self) -> Result<i64, CredentialError> {
        match self {
            Self::EpochSeconds(secs) => Ok(secs.saturating_mul(1_000)),
            Self::Timestamp(raw) => chrono::DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.timestamp_millis())
                .map_err(|e| CredentialError::Decode(format!("expires_at: {e}"))),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    server_url: String,
    room_name: String,
    participant_name: String,
    participant_token: String,
    #[serde(rename = "expires_at", default)]
    expires_at: Option<ExpiresAt>,
}

impl TokenResponse {
    fn into_credential(self) -> Result<Credential, CredentialError> {
        if self.participant_token.is_empty() {
            return Err(CredentialError::Decode(
                "participantToken is empty".to_string(),
            ));
        }
        let expires_at_ms = self.expires_at.map(ExpiresAt::into_millis).transpose()?;
        Ok(Credential {
            value: self.participant_token,
            expires_at_ms,
            server_url: self.server_url,
            room_name: self.room_name,
            participant_name: self.participant_name,
        })
    }
}

/// Fetches credentials with `GET <token_url>?provider=&voice_id=` and an
/// `X-User-Id` header.
#[derive(Debug, Clone)]
pub struct HttpCredentialSource {
    client: reqwest::Client,
    token_url: String,
}

impl HttpCredentialSource {
    pub fn new(token_url: impl Into<String>, timeout: Duration) -> Result<Self, CredentialError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CredentialError::Request(e.to_string()))?;
        Ok(Self {
            client,
            token_url: token_url.into(),
        })
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(
        &self,
        user_id: &str,
        options: &CredentialOptions,
    ) -> Result<Credential, CredentialError> {
        let query = [
            ("provider", options.provider.as_deref().unwrap_or_default()),
            ("voice_id", options.voice_id.as_deref().unwrap_or_default()),
        ];

        let response = self
            .client
            .get(&self.token_url)
            .header("X-User-Id", user_id)
            .query(&query)
            .send()
            .await
            .map_err(|e| CredentialError::Request(e.without_url().to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(CredentialError::Unauthorized {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(CredentialError::Http {
                status: status.as_u16(),
            });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::Decode(e.without_url().to_string()))?;

        let credential = body.into_credential()?;
        tracing::debug!(
            room = %credential.room_name,
            token_len = credential.value.len(),
            expires_at_ms = ?credential.expires_at_ms,
            "fetched participant credential"
        );
        Ok(credential)
    }
}

/// Serves one fixed credential. Used when no token endpoint is configured.
#[derive(Debug, Clone)]
pub struct StaticCredentialSource {
    credential: Credential,
}

impl StaticCredentialSource {
    pub fn new(credential: Credential) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn fetch(
        &self,
        _user_id: &str,
        _options: &CredentialOptions,
    ) -> Result<Credential, CredentialError> {
        Ok(self.credential.clone())
    }
}
