//! # Flare Telemetry
//!
//! Observability for the Flare client itself, as opposed to the telemetry it
//! delivers:
//!
//! - **Structured logging**: `tracing` console output (JSON, pretty or
//!   compact) and an optional daily rolling log file
//! - **Metrics**: an in-process `metrics` recorder whose values can be read
//!   back as a snapshot
//! - **Event monitor**: turns pipeline diagnostic events into log lines and
//!   metrics
//!
//! ## Quick Start
//!
//! ```no_run
//! use flare_telemetry::{TelemetryConfig, TelemetrySystem};
//!
//! fn main() -> flare_telemetry::Result<()> {
//!     let _guard = TelemetrySystem::init(TelemetryConfig::default())?;
//!
//!     tracing::info!("Application started");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod monitor;
pub mod recorder;
pub mod system;

pub use config::{LogFormat, LogLevel, TelemetryConfig};
pub use monitor::EventMonitor;
pub use recorder::{FlareMetricsRecorder, MetricsSnapshot, MetricsSummary};
pub use system::{TelemetryGuard, TelemetrySystem};

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Telemetry-specific errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Telemetry system error: {message}")]
    System { message: String },
}
