//! Configuration of the client's own logging and metrics

use crate::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::Level;

/// Main telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Global enable/disable toggle
    pub enabled: bool,

    pub logging: LoggingConfig,

    pub metrics: MetricsConfig,
}

/// Logging-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,

    /// Output format (JSON, Pretty, Compact)
    pub format: LogFormat,

    pub console_enabled: bool,

    /// Write a daily rolling log file under `log_dir`
    pub file_enabled: bool,

    pub log_dir: PathBuf,

    /// File name prefix; the date is appended per rotation
    pub log_file_name: String,

    /// Include source location in logs
    pub include_location: bool,

    /// Include thread names/IDs
    pub include_thread_info: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the in-process recorder as the global `metrics` recorder
    pub enabled: bool,
}

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(Error::Config {
                message: format!("Unknown log level '{}'", other.to_lowercase()),
            }),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Level::from(*self))
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Structured JSON format
    Json,
    /// Human-readable pretty format
    Pretty,
    /// Compact single-line format
    Compact,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(Error::Config {
                message: format!("Unknown log format '{}'", other),
            }),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            console_enabled: true,
            file_enabled: false,
            log_dir: TelemetryConfig::default_log_dir().unwrap_or_else(|_| PathBuf::from("./logs")),
            log_file_name: "flare.log".to_string(),
            include_location: false,
            include_thread_info: false,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl TelemetryConfig {
    /// Load configuration from file or create default
    pub async fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        let mut config: Self = if config_file.exists() {
            let content = tokio::fs::read_to_string(&config_file).await?;
            toml::from_str(&content).map_err(|e| Error::Config {
                message: format!("Failed to parse telemetry config: {}", e),
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

        let content = toml::to_string_pretty(self).map_err(|e| Error::Config {
            message: format!("Failed to serialize telemetry config: {}", e),
        })?;

        tokio::fs::write(&config_file, content).await?;
        Ok(())
    }

    /// Apply `FLARE_LOG_LEVEL`, `FLARE_LOG_FORMAT` and `FLARE_LOG_DIR`.
    /// Setting a log directory turns file logging on.
    pub fn load_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("FLARE_LOG_LEVEL") {
            self.logging.level = level.parse().unwrap_or(self.logging.level);
        }

        if let Ok(format) = std::env::var("FLARE_LOG_FORMAT") {
            self.logging.format = format.parse().unwrap_or(self.logging.format);
        }

        if let Ok(dir) = std::env::var("FLARE_LOG_DIR") {
            if !dir.trim().is_empty() {
                self.logging.log_dir = PathBuf::from(dir);
                self.logging.file_enabled = true;
            }
        }
    }

    fn default_config_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("dev", "flare", "flare").ok_or_else(|| Error::Config {
            message: "Could not determine config directory".to_string(),
        })?;

        Ok(project_dirs.config_dir().join("telemetry.toml"))
    }

    fn default_log_dir() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("dev", "flare", "flare").ok_or_else(|| Error::Config {
            message: "Could not determine log directory".to_string(),
        })?;

        Ok(project_dirs.data_dir().join("logs"))
    }

    /// Validate configuration, creating the log directory if needed
    pub fn validate(&self) -> Result<()> {
        if self.logging.file_enabled {
            if self.logging.log_file_name.trim().is_empty() {
                return Err(Error::Config {
                    message: "log_file_name must not be empty".to_string(),
                });
            }

            std::fs::create_dir_all(&self.logging.log_dir)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_config_serialization() {
        let config = TelemetryConfig::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: TelemetryConfig = toml::from_str(&serialized).unwrap();

        assert_eq!(config.enabled, deserialized.enabled);
        assert_eq!(config.logging.level, deserialized.logging.level);
        assert_eq!(config.logging.format, deserialized.logging.format);
    }

    #[tokio::test]
    #[serial]
    async fn test_config_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("telemetry.toml");

        let mut original = TelemetryConfig::default();
        original.logging.level = LogLevel::Debug;
        original.save(Some(&config_path)).await.unwrap();

        let loaded = TelemetryConfig::load(Some(&config_path)).await.unwrap();
        assert_eq!(loaded.logging.level, LogLevel::Debug);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        let temp_dir = TempDir::new().unwrap();
        std::env::set_var("FLARE_LOG_LEVEL", "debug");
        std::env::set_var("FLARE_LOG_FORMAT", "json");
        std::env::set_var("FLARE_LOG_DIR", temp_dir.path());

        let mut config = TelemetryConfig::default();
        config.load_env_overrides();

        std::env::remove_var("FLARE_LOG_LEVEL");
        std::env::remove_var("FLARE_LOG_FORMAT");
        std::env::remove_var("FLARE_LOG_DIR");

        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.logging.file_enabled);
        assert_eq!(config.logging.log_dir, temp_dir.path());
    }

    #[test]
    fn test_parsing() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
    }

    #[test]
    fn test_validation_creates_log_dir() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = TelemetryConfig::default();
        config.logging.file_enabled = true;
        config.logging.log_dir = temp_dir.path().join("nested/logs");

        config.validate().unwrap();
        assert!(config.logging.log_dir.is_dir());

        config.logging.log_file_name = " ".to_string();
        assert!(config.validate().is_err());
    }
}
