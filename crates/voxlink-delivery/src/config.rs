use serde::Deserialize;
use std::time::Duration;
use voxlink_runtime::RetryPolicy;

use crate::queue::{MessagePriority, SendOptions};

fn default_max_attempts() -> u32 {
    3
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_retry_max_ms() -> u64 {
    10_000
}

fn default_confirm_window_ms() -> u64 {
    3_000
}

fn default_cleanup_grace_ms() -> u64 {
    5_000
}

fn default_failed_grace_ms() -> u64 {
    30_000
}

fn default_typing_timeout_ms() -> u64 {
    3_000
}

fn default_history_limit() -> usize {
    500
}

/// Delivery settings (`[delivery]`).
#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySettings {
    /// Attempts per message before it is terminally failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Default per-attempt send timeout.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// How long a sent message waits for a receipt before it is assumed
    /// delivered.
    #[serde(default = "default_confirm_window_ms")]
    pub confirm_window_ms: u64,

    /// How long a delivered message stays queryable before it is purged.
    #[serde(default = "default_cleanup_grace_ms")]
    pub cleanup_grace_ms: u64,

    /// How long a terminally failed message stays queryable.
    #[serde(default = "default_failed_grace_ms")]
    pub failed_grace_ms: u64,

    /// Inactivity after which typing is automatically reset to false.
    #[serde(default = "default_typing_timeout_ms")]
    pub typing_timeout_ms: u64,

    /// Maximum number of messages kept in history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            send_timeout_ms: default_send_timeout_ms(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            confirm_window_ms: default_confirm_window_ms(),
            cleanup_grace_ms: default_cleanup_grace_ms(),
            failed_grace_ms: default_failed_grace_ms(),
            typing_timeout_ms: default_typing_timeout_ms(),
            history_limit: default_history_limit(),
        }
    }
}

impl DeliverySettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms),
        )
        .with_max_attempts(self.max_attempts)
    }

    pub fn default_send_options(&self) -> SendOptions {
        SendOptions {
            timeout: Duration::from_millis(self.send_timeout_ms),
            priority: MessagePriority::Normal,
        }
    }

    pub fn confirm_window(&self) -> Duration {
        Duration::from_millis(self.confirm_window_ms)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }

    pub fn failed_grace(&self) -> Duration {
        Duration::from_millis(self.failed_grace_ms)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }
}
