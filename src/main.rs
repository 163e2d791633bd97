//! ble-mqtt-bridge - Main Entry Point
//!
//! Loads the configuration, opens the Bluetooth LE host and runs the bridge
//! until SIGINT or SIGTERM.

use ble_mqtt_bridge::bridge::{termination_signal, BridgeLifecycle};
use ble_mqtt_bridge::config::{BridgeConfig, ConfigError};
use ble_mqtt_bridge::error::BridgeError;
use ble_mqtt_bridge::observability::init_default_logging;
use ble_mqtt_bridge::peripheral::ble::BleHost;
use ble_mqtt_bridge::transport::mqtt::MqttTransport;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info, warn};

/// Bridges BLE temperature/humidity sensors to an MQTT broker
#[derive(Parser)]
#[command(name = "ble-mqtt-bridge")]
#[command(about = "Bridges BLE temperature/humidity sensors to an MQTT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    /// Verbose logging (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge (default)
    Run,
    /// Validate configuration
    Config {
        /// Print the resolved configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(cli.verbose);

    info!("Starting ble-mqtt-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        if e.is_fatal() {
            error!("Command failed: {}", e);
            process::exit(1);
        }
        warn!(error = %e, "Command finished with errors");
    }

    info!("Application shutdown complete");
}

fn load_configuration(path: &Path) -> Result<BridgeConfig, BridgeError> {
    info!("Loading configuration from: {}", path.display());
    Ok(BridgeConfig::load_from_file(path)?)
}

async fn run_bridge(config: BridgeConfig) -> Result<(), BridgeError> {
    let client_id = config.resolve_client_id()?;
    info!(client_id = %client_id, devices = config.devices.len(), "Resolved client ID");

    let termination = termination_signal()
        .map_err(|e| BridgeError::HostInit(format!("failed to install signal handlers: {e}")))?;

    let host = BleHost::new(&config.ble)
        .await
        .map_err(|e| BridgeError::host_init(&e))?;

    let mut bridge =
        BridgeLifecycle::new(config, client_id, Box::new(host), MqttTransport::new())?;
    let (startup, shutdown) = bridge.run(termination).await;

    if startup.connected_devices().is_empty() {
        warn!("No device was connected during this run");
    }
    for result in &shutdown.devices {
        if let Err(e) = &result.result {
            warn!(device = %result.device, error = %e, "Device did not disconnect cleanly");
        }
    }
    if let Err(e) = &shutdown.broker {
        warn!(error = %e, "Broker did not disconnect cleanly");
    }
    Ok(())
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> Result<(), BridgeError> {
    if show {
        let rendered = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::InvalidConfig(format!("failed to render configuration: {e}"))
        })?;
        println!("Current configuration:");
        println!("{rendered}");
    }
    info!(
        devices = config.devices.len(),
        server = %config.mqtt.server(),
        "Configuration is valid"
    );
    Ok(())
}
