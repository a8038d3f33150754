//! chatmq - Twitch chat ⇄ MQTT bridge
//!
//! Usage:
//!   chatmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>     Configuration file path (default: ~/.chatmq/config.toml)
//!   -l, --log-level <LEVEL> Log level (error, warn, info, debug, trace)
//!   --broker <HOST:PORT>    Broker address, overriding the configuration
//!   --check                 Validate and print the configuration, then exit
//!   -h, --help              Print help

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use chatmq::bridge::Bridge;
use chatmq::config::Config;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose, includes raw chat lines)
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

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// chatmq - Twitch chat ⇄ MQTT bridge
#[derive(Parser, Debug)]
#[command(name = "chatmq")]
#[command(author = "chatmq Contributors")]
#[command(version)]
#[command(about = "Bidirectional bridge between Twitch chat rooms and an MQTT broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    /// Broker address (`host` or `host:port`)
    #[arg(long, value_name = "HOST:PORT")]
    broker: Option<String>,

    /// Validate the configuration, print it with secrets redacted and exit
    #[arg(long)]
    check: bool,
}

fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".chatmq").join("config.toml"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // A missing file is fine: defaults plus CHATMQ__* environment overrides
    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = match &config_path {
        Some(path) => Config::load(path),
        None => Config::load("config.toml"),
    }
    .map_err(|e| format!("Error loading configuration: {}", e))?;

    if let Some(address) = &args.broker {
        config.override_broker(address)?;
        config.validate()?;
    }

    if args.check {
        println!("{:#?}", config);
        return Ok(());
    }

    // CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &config_path {
        info!("Loaded configuration from {:?}", path);
    }
    info!(
        "chatmq starting: {} as {} in {} rooms, broker {}",
        config.chat.url,
        config.chat.nick,
        config.chat.rooms.len(),
        config.broker.address()
    );

    let bridge = Bridge::builder(config)?.build();

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    bridge.run(shutdown).await?;
    Ok(())
}
