//! Subscriber installation for the client's own logs

use crate::{
    config::{LogFormat, TelemetryConfig},
    recorder::FlareMetricsRecorder,
    Error, Result,
};
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Builds and installs the tracing subscriber
pub struct TelemetrySystem;

/// Keeps the non-blocking file writer alive; buffered lines are flushed when
/// it is dropped, so hold it until the end of `main`.
pub struct TelemetryGuard {
    _file_guard: Option<WorkerGuard>,
    recorder: Option<FlareMetricsRecorder>,
}

impl TelemetryGuard {
    /// The globally installed metrics recorder, if metrics are enabled.
    pub fn recorder(&self) -> Option<&FlareMetricsRecorder> {
        self.recorder.as_ref()
    }
}

impl std::fmt::Debug for TelemetryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryGuard")
            .field("file_logging", &self._file_guard.is_some())
            .field("metrics", &self.recorder.is_some())
            .finish()
    }
}

impl TelemetrySystem {
    /// Install the subscriber (and, when enabled, the metrics recorder)
    /// process-wide.
    pub fn init(config: TelemetryConfig) -> Result<TelemetryGuard> {
        let (subscriber, mut guard) = Self::build(&config)?;

        subscriber.try_init().map_err(|e| Error::System {
            message: format!("Failed to initialize tracing subscriber: {}", e),
        })?;

        if config.enabled && config.metrics.enabled {
            let recorder = FlareMetricsRecorder::new();
            match recorder.install() {
                Ok(()) => guard.recorder = Some(recorder),
                Err(e) => tracing::warn!(error = %e, "Metrics recorder not installed"),
            }
        }

        tracing::info!(
            flare.event = "telemetry_initialized",
            flare.version = env!("CARGO_PKG_VERSION"),
            format = ?config.logging.format,
            file_logging = config.logging.file_enabled,
            "Telemetry initialized"
        );

        Ok(guard)
    }

    /// Build the subscriber without installing it, for scoped use with
    /// `tracing::subscriber::with_default`.
    pub fn build(
        config: &TelemetryConfig,
    ) -> Result<(impl Subscriber + Send + Sync + 'static, TelemetryGuard)> {
        config.validate()?;

        let mut layers: Vec<BoxedLayer> = Vec::new();
        if let Some(layer) = Self::build_console_layer(config) {
            layers.push(layer);
        }

        let mut file_guard = None;
        if let Some((layer, guard)) = Self::build_file_layer(config) {
            layers.push(layer);
            file_guard = Some(guard);
        }

        let subscriber = Registry::default()
            .with(layers)
            .with(Self::build_env_filter(config));

        Ok((
            subscriber,
            TelemetryGuard {
                _file_guard: file_guard,
                recorder: None,
            },
        ))
    }

    /// `RUST_LOG` wins over the configured level.
    fn build_env_filter(config: &TelemetryConfig) -> EnvFilter {
        if !config.enabled {
            return EnvFilter::new("off");
        }

        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return filter;
        }

        let level: Level = config.logging.level.into();
        EnvFilter::new(format!(
            "{},hyper=warn,reqwest=warn,h2=warn",
            level.as_str().to_lowercase()
        ))
    }

    /// Console output goes to stderr so it never mixes with a host
    /// program's stdout.
    fn build_console_layer(config: &TelemetryConfig) -> Option<BoxedLayer> {
        if !config.enabled || !config.logging.console_enabled {
            return None;
        }

        let logging = &config.logging;
        let layer = match logging.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(false)
                .with_target(true)
                .with_file(logging.include_location)
                .with_line_number(logging.include_location)
                .with_thread_ids(logging.include_thread_info)
                .with_thread_names(logging.include_thread_info)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(logging.include_location)
                .with_line_number(logging.include_location)
                .with_thread_ids(logging.include_thread_info)
                .with_thread_names(logging.include_thread_info)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_file(logging.include_location)
                .with_line_number(logging.include_location)
                .with_thread_ids(logging.include_thread_info)
                .with_thread_names(logging.include_thread_info)
                .boxed(),
        };

        Some(layer)
    }

    /// Daily rolling file written from a background worker.
    fn build_file_layer(config: &TelemetryConfig) -> Option<(BoxedLayer, WorkerGuard)> {
        if !config.enabled || !config.logging.file_enabled {
            return None;
        }

        let logging = &config.logging;
        let appender = tracing_appender::rolling::daily(&logging.log_dir, &logging.log_file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let layer = match logging.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(true)
                .with_span_list(false)
                .with_target(true)
                .with_file(logging.include_location)
                .with_line_number(logging.include_location)
                .boxed(),
            LogFormat::Pretty | LogFormat::Compact => fmt::layer()
                .compact()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_file(logging.include_location)
                .with_line_number(logging.include_location)
                .boxed(),
        };

        Some((layer, guard))
    }
}
