//! Device session binary
//!
//! Loads the device configuration, brings up the broker session, and runs
//! a fixed-length telemetry loop while answering commands from the
//! platform. Meant as the reference wiring for the library; real firmware
//! replaces the telemetry loop with its own sensors.

use clap::{Parser, Subcommand};
use iotc_session::config::DeviceConfig;
use iotc_session::observability::init_default_logging;
use iotc_session::session::IotcSession;
use iotc_session::telemetry::TelemetryMessage;
use iotc_session::transport::MqttTransport;
use iotc_session::{OtaEvent, SessionStatus};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// IoTConnect device session manager
#[derive(Parser)]
#[command(name = "iotc-session")]
#[command(about = "IoTConnect device session manager")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the platform and run the telemetry loop
    Run,
    /// Validate configuration
    Config {
        /// Show the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();
    info!("iotc-session v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_session(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {e}");
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<DeviceConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(DeviceConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["device.toml", "config/device.toml"];
            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(DeviceConfig::load_from_file(&path)?);
                }
            }
            Err("no configuration file found; provide one with -c/--config or create device.toml"
                .into())
        }
    }
}

fn handle_config_command(
    config: DeviceConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Configuration is valid");
    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

async fn run_session(config: DeviceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let session_config = config.to_session_config()?;
    info!(
        device_id = %session_config.device_id,
        environment = %session_config.environment,
        "Starting device session"
    );

    let session = Arc::new(IotcSession::new(session_config, MqttTransport::new()));
    register_handlers(&session);

    session.start().await?;

    let demo = &config.demo;
    info!(
        iterations = demo.telemetry_iterations,
        interval_secs = demo.telemetry_interval_secs,
        "Session live, entering telemetry loop"
    );

    let loop_session = session.clone();
    let app_version = demo.app_version.clone();
    let interval = Duration::from_secs(demo.telemetry_interval_secs);
    let iterations = demo.telemetry_iterations;

    let telemetry_loop = async move {
        for iteration in 1..=iterations {
            let mut message = TelemetryMessage::new();
            message.set("version", app_version.as_str());
            message.set("cpu", 33);

            match loop_session.publish_telemetry(message).await {
                Ok(message_id) => {
                    info!(iteration, message_id, "Telemetry sent");
                }
                Err(e) => warn!(iteration, "Telemetry publish failed: {e}"),
            }
            if iteration < iterations {
                sleep(interval).await;
            }
        }
    };

    tokio::select! {
        _ = telemetry_loop => {
            info!("Telemetry loop finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
        }
    }

    session.disconnect().await?;
    Ok(())
}

/// Wire the application callbacks.
///
/// Commands are acknowledged but not executed; OTA requests are refused.
/// Firmware builds hook their own logic here.
fn register_handlers(session: &Arc<IotcSession<MqttTransport>>) {
    let ack_session = session.clone();
    session.register_command_handler(move |cmd| {
        info!(command = %cmd.command, "Device command received");
        if let Some(ack) = cmd.ack {
            let session = ack_session.clone();
            tokio::spawn(async move {
                if let Err(e) = session.publish_ack(ack, false, Some("Not implemented")).await {
                    warn!("Command ack failed: {e}");
                }
            });
        }
    });

    let ack_session = session.clone();
    session.register_ota_handler(move |event| {
        let ack = match event {
            OtaEvent::Update(update) => {
                info!(url = %update.download_url, version = ?update.version, "OTA update offered");
                update.ack
            }
            OtaEvent::LegacyCommand(cmd) => {
                info!(command = %cmd.command, "Legacy OTA command received");
                cmd.ack
            }
        };
        if let Some(ack) = ack {
            let session = ack_session.clone();
            tokio::spawn(async move {
                if let Err(e) = session
                    .publish_ack(ack, false, Some("OTA not supported"))
                    .await
                {
                    warn!("OTA ack failed: {e}");
                }
            });
        }
    });

    session.register_status_handler(|status| match status {
        SessionStatus::Connected => info!("Session status: connected"),
        SessionStatus::Disconnected => warn!("Session status: disconnected"),
        SessionStatus::Published(id) => info!(message_id = id, "Session status: published"),
        SessionStatus::Failed => error!("Session status: failed"),
    });
}
