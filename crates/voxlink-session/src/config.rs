//! Session configuration loading from file and environment variables.

use serde::Deserialize;
use thiserror::Error;
use voxlink_credentials::CredentialSettings;
use voxlink_delivery::DeliverySettings;
use voxlink_transport::ConnectionSettings;
use voxlink_types::SessionError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Credential endpoint and retry settings.
    #[serde(default)]
    pub credentials: CredentialSettings,

    /// Connection and reconnection settings.
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Message delivery settings.
    #[serde(default)]
    pub delivery: DeliverySettings,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "voxlink_delivery=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file parsed but a value is out of range.
    #[error("invalid config value: {0}")]
    Invalid(String),
}

impl From<ConfigError> for SessionError {
    fn from(err: ConfigError) -> Self {
        SessionError::Config(err.to_string())
    }
}

impl Config {
    /// Rejects values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.credentials.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "credentials.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.delivery.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "delivery.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.delivery.history_limit == 0 {
            return Err(ConfigError::Invalid(
                "delivery.history_limit must be at least 1".to_string(),
            ));
        }
        let url = self.credentials.token_url.trim();
        if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "credentials.token_url must be an http(s) URL, got {url:?}"
            )));
        }
        Ok(())
    }

    /// Applies overrides from `lookup`, which maps variable names to values.
    ///
    /// - `VOXLINK_TOKEN_URL` overrides `credentials.token_url`
    /// - `VOXLINK_PROVIDER` overrides `credentials.provider`
    /// - `VOXLINK_VOICE_ID` overrides `credentials.voice_id`
    /// - `VOXLINK_LOG_LEVEL` overrides `logging.level`
    /// - `VOXLINK_LOG_JSON` overrides `logging.json` (set to "true" to enable)
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("VOXLINK_TOKEN_URL") {
            self.credentials.token_url = url;
        }
        if let Some(provider) = lookup("VOXLINK_PROVIDER") {
            self.credentials.provider = Some(provider);
        }
        if let Some(voice_id) = lookup("VOXLINK_VOICE_ID") {
            self.credentials.voice_id = Some(voice_id);
        }
        if let Some(level) = lookup("VOXLINK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("VOXLINK_LOG_JSON") {
            self.logging.json = json == "true" || json == "1";
        }
    }
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies `VOXLINK_*` environment overrides (see [`Config::apply_overrides`]).
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the resulting configuration is invalid.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    config.apply_overrides(|name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}
