//! Solar charge controller bridge - main entry point

use clap::{Parser, Subcommand};
use solarbridge::bridge::{read_measurements, BridgeSupervisor};
use solarbridge::config::{BridgeConfig, DEFAULT_CONFIG_PATHS};
use solarbridge::device::{DeviceLink, TcpConnector};
use solarbridge::error::BridgeResult;
use solarbridge::observability::{init_default_logging, metrics::metrics, BridgeState};
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tracing::{error, info, warn};

/// Solar charge controller to MQTT bridge
#[derive(Parser)]
#[command(name = "solarbridge")]
#[command(about = "Poll a solar charge controller over Modbus TCP and publish its telemetry to MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Read the controller once and print the measurements as JSON
    Read,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(cli.verbose);

    info!("Starting solarbridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Read => read_once(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> BridgeResult<BridgeConfig> {
    let path = BridgeConfig::resolve_path(config_path, &DEFAULT_CONFIG_PATHS)?;
    info!("Loading configuration from: {}", path.display());
    Ok(BridgeConfig::load_from_file(&path)?)
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let (mut sigint, mut sigterm) = match (
        signal::unix::signal(signal::unix::SignalKind::interrupt()),
        signal::unix::signal(signal::unix::SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to install signal handlers, falling back to Ctrl-C");
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to wait for Ctrl-C");
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }
}

async fn run_bridge(config: BridgeConfig) -> BridgeResult<()> {
    info!(
        device = %format!("{}:{}", config.device.host, config.device.port),
        broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
        base_topic = %config.mqtt.base_topic,
        interval_secs = config.poll.interval_secs,
        "Bridge configured"
    );
    metrics().set_state(BridgeState::Starting);

    BridgeSupervisor::from_config(&config)
        .run(shutdown_signal())
        .await?;
    Ok(())
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> BridgeResult<()> {
    if show {
        match toml::to_string_pretty(&config.redacted()) {
            Ok(rendered) => {
                println!("Current configuration:");
                println!("{rendered}");
            }
            Err(e) => warn!(error = %e, "Failed to render configuration"),
        }
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn read_once(config: &BridgeConfig) -> BridgeResult<()> {
    let mut link = DeviceLink::new(
        TcpConnector::from_config(&config.device),
        config.device.unit_id,
        config.device.timeout(),
    );

    let set = read_measurements(&mut link).await;
    link.disconnect();
    let set = set?;

    match serde_json::to_string_pretty(&set) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(error = %e, "Failed to render measurements"),
    }
    Ok(())
}
