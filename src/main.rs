//! meshbridge - MQTT bridge agent
//!
//! Usage:
//!   meshbridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   --localurl <URL>       URL for the local broker (default: tcp://localhost:1883)
//!   --serial <SERIAL>      Serial number of the device
//!   --status <SECS>        Seconds between status messages
//!   --debug                Enable debug output
//!   --trace                Enable trace output
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use meshbridge::{Agent, Bus, Config};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// meshbridge - MQTT bridge agent
#[derive(Parser, Debug)]
#[command(name = "meshbridge")]
#[command(version = "0.1.0")]
#[command(about = "Bridges a local MQTT broker to a cloud broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// URL for the local broker
    #[arg(long)]
    localurl: Option<String>,

    /// Serial number of the device
    #[arg(long)]
    serial: Option<String>,

    /// Seconds between status messages
    #[arg(long)]
    status: Option<u64>,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    /// Enable trace output
    #[arg(long)]
    trace: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use defaults
    let mut config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    // CLI args override file config
    if let Some(localurl) = args.localurl {
        config.local_url = localurl;
    }
    if let Some(serial) = args.serial {
        config.serial_no = serial;
    }
    if let Some(status) = args.status {
        config.status_interval = status;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // Setup logging - shortcut flags beat the CLI level, which beats config
    let log_level = if args.trace {
        Level::TRACE
    } else if args.debug {
        Level::DEBUG
    } else if let Some(level) = args.log_level {
        level.to_tracing_level()
    } else {
        match config.log.level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting meshbridge agent");
    info!("  Local url: {}", config.local_url);
    info!("  Serial: {}", config.serial_no);
    info!(
        "  Status every {}s, metrics every {}s",
        config.status_interval, config.metrics_interval
    );

    let conf = Arc::new(config);
    let agent = Arc::new(Agent::new(conf.clone()));

    let bus = match Bus::listen(conf, agent.clone()).await {
        Ok(bus) => bus,
        Err(e) => {
            eprintln!("Error connecting to the local broker: {}", e);
            std::process::exit(1);
        }
    };

    wait_for_signal().await?;

    info!("Caught signal, shutting down");
    agent.shutdown().await;
    bus.stop().await;

    Ok(())
}

/// Block until SIGINT, SIGTERM or SIGHUP.
#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
