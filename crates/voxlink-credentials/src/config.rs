use serde::Deserialize;
use std::time::Duration;
use voxlink_runtime::RetryPolicy;

fn default_refresh_buffer_secs() -> u64 {
    60
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_jitter_ms() -> u64 {
    250
}

/// Credential endpoint and retry settings (`[credentials]`).
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialSettings {
    /// Token endpoint URL. Empty selects the static development credential.
    #[serde(default)]
    pub token_url: String,

    /// Value of the `provider` query parameter.
    #[serde(default)]
    pub provider: Option<String>,

    /// Value of the `voice_id` query parameter.
    #[serde(default)]
    pub voice_id: Option<String>,

    /// How long before expiry a cached credential stops being served.
    #[serde(default = "default_refresh_buffer_secs")]
    pub refresh_buffer_secs: u64,

    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            token_url: String::new(),
            provider: None,
            voice_id: None,
            refresh_buffer_secs: default_refresh_buffer_secs(),
            request_timeout_ms: default_request_timeout_ms(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl CredentialSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(Duration::from_millis(self.jitter_ms))
        .with_max_attempts(self.max_attempts)
    }

    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.refresh_buffer_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
