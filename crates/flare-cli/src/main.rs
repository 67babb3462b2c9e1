use anyhow::Result;
use clap::{Parser, Subcommand};
use flare_core::{EventHub, FlareConfig, Level, Report};
use flare_pipeline::{Notifier, QueueController, ReportStatus};
use flare_telemetry::{EventMonitor, LogFormat, LogLevel, TelemetryConfig, TelemetrySystem};
use flare_transport::SenderFactory;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n  FLARE_ACCESS_TOKEN, FLARE_ENVIRONMENT and FLARE_ENDPOINT override the config file.\n  A .env file in the current directory is read first.\n\nEXAMPLES:\n  flare send --level error --message \"disk full\" --custom host=db-1\n  flare --no-transmit send --message \"dry run\"\n  flare config init"
)]
struct Cli {
    /// Configuration file path
    #[arg(long, global = true, help = "Path to configuration file")]
    config: Option<PathBuf>,

    /// Project access token
    #[arg(long, global = true, help = "Override the project access token")]
    access_token: Option<String>,

    /// Environment name
    #[arg(long, global = true, help = "Override the environment name")]
    environment: Option<String>,

    /// Collector base URL
    #[arg(long, global = true, help = "Override the collector endpoint")]
    endpoint: Option<String>,

    /// Process reports without sending them
    #[arg(
        long,
        global = true,
        help = "Package and queue reports but never send them over the network"
    )]
    no_transmit: bool,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(long, global = true, help = "Set log level")]
    log_level: Option<String>,

    /// Set log format (json, pretty, compact)
    #[arg(long, global = true, help = "Set log output format")]
    log_format: Option<String>,

    /// Set log directory
    #[arg(long, global = true, help = "Write logs to a daily file in this directory")]
    log_dir: Option<PathBuf>,

    /// Enable the in-process metrics recorder
    #[arg(long, global = true, help = "Record client metrics and print a summary on exit")]
    metrics: bool,

    /// Telemetry configuration file
    #[arg(long, global = true, help = "Path to telemetry configuration file")]
    telemetry_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a single report and wait for it to settle
    Send(SendArgs),

    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
struct SendArgs {
    #[arg(long, default_value = "error", help = "Report level (debug, info, warning, error, critical)")]
    level: String,

    #[arg(short, long, help = "Message text")]
    message: String,

    #[arg(long, help = "Optional report title")]
    title: Option<String>,

    /// Repeatable `key=value`; values that parse as JSON are kept typed
    #[arg(long = "custom", value_parser = parse_custom, help = "Attach custom data as key=value")]
    custom: Vec<(String, serde_json::Value)>,

    #[arg(long, default_value_t = 5_000, help = "How long to wait for delivery, in milliseconds")]
    wait_ms: u64,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved configuration with the access token masked
    Show,

    /// Write a default configuration file
    Init {
        #[arg(long, help = "Overwrite an existing file")]
        force: bool,
    },
}

fn parse_custom(raw: &str) -> std::result::Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }

    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

/// Create telemetry configuration from CLI arguments
async fn create_telemetry_config(cli: &Cli) -> Result<TelemetryConfig> {
    let mut config = TelemetryConfig::load(cli.telemetry_config.as_deref())
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to load telemetry config, using defaults: {}", e);
            TelemetryConfig::default()
        });

    if let Some(level) = &cli.log_level {
        config.logging.level = level
            .parse::<LogLevel>()
            .map_err(|e| anyhow::anyhow!("Invalid --log-level: {}", e))?;
    }

    if let Some(format) = &cli.log_format {
        config.logging.format = format
            .parse::<LogFormat>()
            .map_err(|e| anyhow::anyhow!("Invalid --log-format: {}", e))?;
    }

    if let Some(dir) = &cli.log_dir {
        config.logging.log_dir = dir.clone();
        config.logging.file_enabled = true;
    }

    if cli.metrics {
        config.metrics.enabled = true;
    }

    Ok(config)
}

/// Resolve the client configuration: file, then environment, then flags.
async fn create_flare_config(cli: &Cli) -> Result<FlareConfig> {
    let mut config = FlareConfig::load(cli.config.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    if let Some(token) = &cli.access_token {
        config.access_token = token.clone();
    }
    if let Some(environment) = &cli.environment {
        config.environment = environment.clone();
    }
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if cli.no_transmit {
        config.transmit = false;
    }

    Ok(config)
}

fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

async fn run_send(cli: &Cli, args: &SendArgs) -> Result<()> {
    let config = create_flare_config(cli).await?;
    let level: Level = args
        .level
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid --level: {}", e))?;

    SenderFactory::validate_config(&config)?;
    let sender = SenderFactory::create_sender(&config)?;

    let events = EventHub::new();
    let _monitor = EventMonitor::attach(&events);
    let controller = QueueController::from_config(&config, sender, events).build();
    controller.start()?;

    let notifier = Notifier::new(config, &controller).await?;

    let mut report = Report::message(level, args.message.clone());
    if let Some(title) = &args.title {
        report = report.with_title(title.clone());
    }
    for (key, value) in &args.custom {
        report = report.with_custom(key.clone(), value);
    }

    let status = notifier
        .report_and_wait(report, Duration::from_millis(args.wait_ms))
        .await;
    let summary = controller.shutdown().await;

    info!(
        flare.event = "send_finished",
        status = ?status,
        delivered = summary.delivered,
        persisted = summary.persisted,
        dropped = summary.dropped,
        "Send finished"
    );

    match status {
        ReportStatus::Delivered => {
            println!("delivered");
            Ok(())
        }
        ReportStatus::Ignored => {
            println!("ignored (below min_level or reporting disabled)");
            Ok(())
        }
        ReportStatus::TimedOut if summary.delivered > 0 => {
            println!("delivered during shutdown");
            Ok(())
        }
        other => {
            error!(status = ?other, "Report was not delivered");
            Err(anyhow::anyhow!("Report was not delivered: {:?}", other))
        }
    }
}

async fn run_config(cli: &Cli, action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let mut config = create_flare_config(cli).await?;
            if !config.access_token.is_empty() {
                config.access_token = mask_token(&config.access_token);
            }
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigAction::Init { force } => {
            let path = match &cli.config {
                Some(path) => path.clone(),
                None => FlareConfig::default_config_path()?,
            };
            if path.exists() && !force {
                return Err(anyhow::anyhow!(
                    "{} already exists; pass --force to overwrite",
                    path.display()
                ));
            }

            FlareConfig::default().save(Some(&path)).await?;
            info!(flare.event = "config_initialized", path = %path.display(), "Configuration written");
            println!("{}", path.display());
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables before parsing configuration
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let telemetry_config = create_telemetry_config(&cli).await?;
    let telemetry_guard = TelemetrySystem::init(telemetry_config).map_err(|e| {
        eprintln!("Failed to initialize telemetry system: {}", e);
        anyhow::anyhow!("Telemetry initialization failed: {}", e)
    })?;

    let result = match &cli.command {
        Commands::Send(args) => run_send(&cli, args).await,
        Commands::Config { action } => run_config(&cli, action).await,
    };

    if let Some(recorder) = telemetry_guard.recorder() {
        let summary = recorder.summary();
        info!(
            flare.event = "metrics_summary",
            counters = summary.counter_count,
            counter_total = summary.counter_total,
            gauges = summary.gauge_count,
            histograms = summary.histogram_count,
            "Client metrics"
        );
        for (key, value) in recorder.snapshot().counters {
            eprintln!("{} {}", key, value);
        }
    }

    if let Err(e) = &result {
        warn!("flare exited with an error: {}", e);
    }
    result
}
