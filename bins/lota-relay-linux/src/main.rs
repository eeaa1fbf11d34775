use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serialport::SerialPort;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lota_core::{FlowControl, Parity, RelayConfig, SerialConfig, SerialEventProcessor};
use lota_server::{EmbeddedResources, LoggingHandler, RelayServer, SoftUart};

/// Port read timeout. Quiet periods this long release held-back marker bytes.
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "lota-relay")]
#[command(version)]
#[command(about = "Relay a serial link to WebSocket clients and serve the LOTA dashboard")]
struct Args {
    /// JSON configuration file; defaults are used when absent
    #[arg(env = "LOTA_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,lota_server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("LOTA relay starting...");

    let config = load_config(args.config.as_deref())?;
    let server = RelayServer::bind(
        config.clone(),
        Arc::new(EmbeddedResources),
        Arc::new(LoggingHandler),
    )
    .await?;

    match open_serial(&config.serial) {
        Ok((reader, writer)) => {
            let (driver, ingest, events) = SoftUart::new(&config.serial, writer);
            ingest.spawn(reader)?;
            server.attach_serial(SerialEventProcessor::new(driver, &config.serial), events)?;
            tracing::info!(
                "Relaying {} at {} baud, pattern {:?} x{}",
                config.serial.port,
                config.serial.baud_rate,
                config.serial.pattern_char,
                config.serial.pattern_len
            );
        }
        Err(e) => {
            tracing::warn!(
                "Serial port {} unavailable ({}), serving heartbeat only",
                config.serial.port,
                e
            );
        }
    }

    let addr = server.local_addr()?;
    tracing::info!("LOTA relay ready!");
    tracing::info!("   Dashboard: http://{}/", addr);
    tracing::info!("   WebSocket: ws://{}/", addr);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        result = server.run() => {
            // The listener is gone; exit non-zero so the supervisor restarts us.
            let e = match result {
                Ok(()) => anyhow::anyhow!("relay stopped"),
                Err(e) => anyhow::Error::new(e),
            };
            tracing::error!("Relay failed: {}", e);
            return Err(e.context("relay must be restarted"));
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Load configuration from `path`, falling back to defaults.
fn load_config(path: Option<&Path>) -> anyhow::Result<RelayConfig> {
    match path {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            RelayConfig::from_file(path)
                .with_context(|| format!("Invalid configuration in {}", path.display()))
        }
        None => {
            tracing::info!("No configuration file given, using defaults");
            Ok(RelayConfig::default())
        }
    }
}

/// Open the serial device and return independent read and write handles.
fn open_serial(
    config: &SerialConfig,
) -> serialport::Result<(Box<dyn SerialPort>, Box<dyn SerialPort>)> {
    let data_bits = match config.data_bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    };
    let parity = match config.parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    };
    let stop_bits = match config.stop_bits {
        2 => serialport::StopBits::Two,
        _ => serialport::StopBits::One,
    };
    let flow_control = match config.flow_control {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::Software => serialport::FlowControl::Software,
        FlowControl::Hardware => serialport::FlowControl::Hardware,
    };

    let port = serialport::new(&config.port, config.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(flow_control)
        .timeout(PORT_READ_TIMEOUT)
        .open()?;
    let writer = port.try_clone()?;
    Ok((port, writer))
}
