//! Resolved client configuration

use crate::payload::{Destination, Level};
use crate::scrub::Scrubber;
use crate::truncation::TruncationStrategy;
use crate::{FlareError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://api.flare.dev/api/1/";

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlareConfig {
    /// Project access token sent with every payload
    pub access_token: String,

    /// Environment name (production, staging, ...)
    pub environment: String,

    /// Collector base URL; payloads are posted to `{endpoint}item/`
    pub endpoint: String,

    /// Global enable/disable toggle
    pub enabled: bool,

    /// When false, payloads are processed but never sent over the network
    pub transmit: bool,

    /// Reports below this level are ignored
    pub min_level: Level,

    /// Version of the reporting application
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_version: Option<String>,

    pub queue: QueueConfig,
    pub delivery: DeliveryConfig,
    pub truncation: TruncationConfig,
    pub privacy: PrivacyConfig,
    pub shutdown: ShutdownConfig,
}

/// Per-destination queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of pending payloads per destination
    pub max_depth: usize,

    /// What to do when a full queue receives another payload
    pub overflow_policy: OverflowPolicy,
}

/// Delivery, rate limiting and retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Global cap on delivery attempts per minute (0 disables the limit)
    pub max_reports_per_minute: u32,

    /// HTTP request timeout (in seconds)
    pub request_timeout_secs: u64,

    /// Retries allowed after the first failed attempt
    pub max_retries: u32,

    /// First backoff delay (in milliseconds)
    pub initial_retry_delay_ms: u64,

    /// Backoff ceiling (in milliseconds)
    pub max_retry_delay_ms: u64,

    /// Pause between drain-loop scans (in milliseconds)
    pub scan_interval_ms: u64,

    /// Optional HTTP(S) proxy URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// Hand payloads that cannot be delivered to the offline store, if one is attached
    pub persist_undelivered: bool,
}

/// Payload size ceiling and truncation chain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncationConfig {
    /// Serialized payload size ceiling (in bytes)
    pub max_payload_size_bytes: usize,

    /// Strategies in application order
    pub strategies: Vec<TruncationStrategy>,
}

/// Scrubbing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Enable scrubbing before payloads are queued
    pub scrub_enabled: bool,

    /// Keys whose values are always redacted (case-insensitive substring match)
    pub scrub_fields: Vec<String>,

    /// Regex patterns redacted from free text
    pub scrub_patterns: Vec<String>,
}

/// Behaviour when the controller shuts down
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub mode: ShutdownMode,

    /// Upper bound on the whole shutdown (in milliseconds)
    pub timeout_ms: u64,
}

/// Queue overflow policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest pending payload to admit the new one
    #[default]
    DropOldest,
    /// Keep the queue as is and refuse the new payload
    DropNewest,
}

/// Whether pending payloads are delivered or discarded at shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    #[default]
    Flush,
    Drop,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: 500,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_reports_per_minute: 60,
            request_timeout_secs: 30,
            max_retries: 3,
            initial_retry_delay_ms: 500,
            max_retry_delay_ms: 60_000,
            scan_interval_ms: 250,
            proxy: None,
            persist_undelivered: true,
        }
    }
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            max_payload_size_bytes: 512 * 1024,
            strategies: TruncationStrategy::default_chain(),
        }
    }
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            scrub_enabled: true,
            scrub_fields: vec![
                "password".to_string(),
                "passwd".to_string(),
                "secret".to_string(),
                "token".to_string(),
                "api_key".to_string(),
                "authorization".to_string(),
                "cookie".to_string(),
            ],
            scrub_patterns: vec![
                // Credit card numbers
                r"\b\d{4}[\s\-]?\d{4}[\s\-]?\d{4}[\s\-]?\d{4}\b".to_string(),
                // Social security numbers
                r"\b\d{3}-\d{2}-\d{4}\b".to_string(),
            ],
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            mode: ShutdownMode::Flush,
            timeout_ms: 5_000,
        }
    }
}

impl Default for FlareConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            environment: "production".to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            enabled: true,
            transmit: true,
            min_level: Level::Debug,
            code_version: None,
            queue: QueueConfig::default(),
            delivery: DeliveryConfig::default(),
            truncation: TruncationConfig::default(),
            privacy: PrivacyConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl DeliveryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl FlareConfig {
    pub fn new(access_token: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            environment: environment.into(),
            ..Self::default()
        }
    }

    pub fn destination(&self) -> Destination {
        Destination::new(self.access_token.clone(), self.environment.clone())
    }

    /// Full URL payloads are posted to
    pub fn item_url(&self) -> String {
        if self.endpoint.ends_with('/') {
            format!("{}item/", self.endpoint)
        } else {
            format!("{}/item/", self.endpoint)
        }
    }

    /// Build the scrubber described by the privacy settings
    pub fn scrubber(&self) -> Result<Scrubber> {
        if self.privacy.scrub_enabled {
            Scrubber::new(&self.privacy)
        } else {
            Ok(Scrubber::disabled())
        }
    }

    /// Load configuration from file or create default, then apply environment overrides
    pub async fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        let mut config = if config_file.exists() {
            let content = tokio::fs::read_to_string(&config_file).await?;
            toml::from_str(&content).map_err(|e| FlareError::Config {
                message: format!("Failed to parse config {}: {}", config_file.display(), e),
            })?
        } else {
            Self::default()
        };

        config.load_env_overrides();
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, config_path: Option<&Path>) -> Result<()> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = config_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| FlareError::Config {
            message: format!("Failed to serialize config: {}", e),
        })?;

        tokio::fs::write(&config_file, content).await?;
        Ok(())
    }

    /// Apply `FLARE_*` environment variable overrides
    pub fn load_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("FLARE_ACCESS_TOKEN") {
            self.access_token = token;
        }

        if let Ok(environment) = std::env::var("FLARE_ENVIRONMENT") {
            self.environment = environment;
        }

        if let Ok(endpoint) = std::env::var("FLARE_ENDPOINT") {
            self.endpoint = endpoint;
        }

        if let Ok(enabled) = std::env::var("FLARE_ENABLED") {
            self.enabled = enabled.parse().unwrap_or(self.enabled);
        }

        if let Ok(transmit) = std::env::var("FLARE_TRANSMIT") {
            self.transmit = transmit.parse().unwrap_or(self.transmit);
        }

        if let Ok(limit) = std::env::var("FLARE_MAX_REPORTS_PER_MINUTE") {
            self.delivery.max_reports_per_minute =
                limit.parse().unwrap_or(self.delivery.max_reports_per_minute);
        }

        if let Ok(depth) = std::env::var("FLARE_MAX_QUEUE_DEPTH") {
            self.queue.max_depth = depth.parse().unwrap_or(self.queue.max_depth);
        }
    }

    /// Default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("dev", "flare", "flare").ok_or_else(|| FlareError::Config {
                message: "Could not determine config directory".to_string(),
            })?;

        Ok(project_dirs.config_dir().join("flare.toml"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.transmit && self.access_token.trim().is_empty() {
            return Err(config_error("access_token is required when transmitting"));
        }

        if self.environment.trim().is_empty() {
            return Err(config_error("environment must not be empty"));
        }

        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(config_error("endpoint must start with http:// or https://"));
        }

        if let Some(proxy) = &self.delivery.proxy {
            if !proxy.starts_with("http://") && !proxy.starts_with("https://") {
                return Err(config_error("proxy must start with http:// or https://"));
            }
        }

        if self.queue.max_depth == 0 {
            return Err(config_error("queue.max_depth must be greater than 0"));
        }

        if self.delivery.scan_interval_ms == 0 {
            return Err(config_error("delivery.scan_interval_ms must be greater than 0"));
        }

        if self.delivery.initial_retry_delay_ms > self.delivery.max_retry_delay_ms {
            return Err(config_error(
                "delivery.initial_retry_delay_ms must not exceed max_retry_delay_ms",
            ));
        }

        if self.truncation.max_payload_size_bytes == 0 {
            return Err(config_error(
                "truncation.max_payload_size_bytes must be greater than 0",
            ));
        }

        if self.truncation.strategies.is_empty() {
            return Err(config_error("truncation.strategies must not be empty"));
        }

        for strategy in &self.truncation.strategies {
            strategy.validate()?;
        }

        if self.privacy.scrub_enabled {
            Scrubber::new(&self.privacy)?;
        }

        Ok(())
    }
}

fn config_error(message: &str) -> FlareError {
    FlareError::Config {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_config_serialization() {
        let config = FlareConfig::new("abc123", "staging");
        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: FlareConfig = toml::from_str(&serialized).unwrap();

        assert_eq!(config.access_token, deserialized.access_token);
        assert_eq!(config.environment, deserialized.environment);
        assert_eq!(
            config.truncation.strategies,
            deserialized.truncation.strategies
        );
        assert_eq!(config.queue.overflow_policy, deserialized.queue.overflow_policy);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: FlareConfig = toml::from_str(
            r#"
            access_token = "abc"

            [queue]
            max_depth = 3
            overflow_policy = "drop_newest"
            "#,
        )
        .unwrap();

        assert_eq!(config.queue.max_depth, 3);
        assert_eq!(config.queue.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.environment, "production");
        assert_eq!(config.delivery.max_reports_per_minute, 60);
    }

    #[tokio::test]
    #[serial]
    async fn test_config_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("flare.toml");

        let mut original = FlareConfig::new("abc123", "staging");
        original.truncation.max_payload_size_bytes = 400;
        original.save(Some(&config_path)).await.unwrap();

        let loaded = FlareConfig::load(Some(&config_path)).await.unwrap();
        assert_eq!(loaded.access_token, "abc123");
        assert_eq!(loaded.truncation.max_payload_size_bytes, 400);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("FLARE_ACCESS_TOKEN", "from-env");
        std::env::set_var("FLARE_MAX_REPORTS_PER_MINUTE", "5");
        std::env::set_var("FLARE_ENABLED", "not-a-bool");

        let mut config = FlareConfig::default();
        config.load_env_overrides();

        assert_eq!(config.access_token, "from-env");
        assert_eq!(config.delivery.max_reports_per_minute, 5);
        assert!(config.enabled);

        std::env::remove_var("FLARE_ACCESS_TOKEN");
        std::env::remove_var("FLARE_MAX_REPORTS_PER_MINUTE");
        std::env::remove_var("FLARE_ENABLED");
    }

    #[test]
    fn test_config_validation() {
        let mut config = FlareConfig::default();
        assert!(config.validate().is_err(), "missing token must be rejected");

        config.access_token = "abc".to_string();
        assert!(config.validate().is_ok());

        config.transmit = false;
        config.access_token.clear();
        assert!(config.validate().is_ok(), "token is optional without transmit");

        config.endpoint = "ftp://collector".to_string();
        assert!(config.validate().is_err());
        config.endpoint = DEFAULT_ENDPOINT.to_string();

        config.queue.max_depth = 0;
        assert!(config.validate().is_err());
        config.queue.max_depth = 10;

        config.privacy.scrub_patterns = vec!["[invalid".to_string()];
        assert!(config.validate().is_err());
        config.privacy.scrub_patterns.clear();

        config.truncation.strategies = vec![TruncationStrategy::Strings { limit: 2 }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_item_url() {
        let mut config = FlareConfig::default();
        config.endpoint = "http://localhost:8080/api/1".to_string();
        assert_eq!(config.item_url(), "http://localhost:8080/api/1/item/");

        config.endpoint = DEFAULT_ENDPOINT.to_string();
        assert_eq!(config.item_url(), "https://api.flare.dev/api/1/item/");
    }
}
