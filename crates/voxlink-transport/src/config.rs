use serde::Deserialize;
use std::time::Duration;
use voxlink_runtime::RetryPolicy;

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_reconnect_budget_secs() -> u64 {
    30
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

/// Connection and reconnection settings (`[connection]`).
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound on the summed backoff delays of one reconnection episode.
    #[serde(default = "default_reconnect_budget_secs")]
    pub reconnect_budget_secs: u64,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_budget_secs: default_reconnect_budget_secs(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl ConnectionSettings {
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(Duration::from_millis(self.jitter_ms))
    }

    pub fn reconnect_budget(&self) -> Duration {
        Duration::from_secs(self.reconnect_budget_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
