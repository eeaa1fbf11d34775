//! LOTA relay firmware for ESP32.
//!
//! Brings up the `LOTA` access point, serves the dashboard on port 80 and
//! relays UART traffic to every connected WebSocket client. Any fatal
//! error restarts the chip.

use std::sync::Arc;

use esp_idf_svc::{
    eventloop::EspSystemEventLoop, hal::peripherals::Peripherals, log::EspLogger,
    nvs::EspDefaultNvsPartition,
};
use log::{error, info};

use lota_core::{RelayConfig, SerialEventProcessor};
use lota_esp32::{
    uart::{open_uart, UartReader, UartWriter},
    wifi::{start_access_point, subscribe_ap_events},
};
use lota_server::{EmbeddedResources, LoggingHandler, RelayServer, SoftUart};

fn main() {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    info!("LOTA relay starting...");

    if let Err(e) = run() {
        error!("Relay failed: {:?}", e);
    }

    info!("Restarting...");
    esp_idf_svc::hal::reset::restart();
}

fn run() -> anyhow::Result<()> {
    let config = RelayConfig::default();
    config.validate()?;

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let _ap_events = subscribe_ap_events(&sysloop)?;
    let _wifi = start_access_point(&config.access_point, peripherals.modem, sysloop, nvs)?;

    let (reader, writer) = open_uart(
        &config.serial,
        peripherals.uart1,
        peripherals.pins.gpio4,
        peripherals.pins.gpio5,
    )?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(serve(config, reader, writer))
}

async fn serve(config: RelayConfig, reader: UartReader, writer: UartWriter) -> anyhow::Result<()> {
    let server = RelayServer::bind(
        config.clone(),
        Arc::new(EmbeddedResources),
        Arc::new(LoggingHandler),
    )
    .await?;

    let (driver, ingest, events) = SoftUart::new(&config.serial, writer);
    ingest.spawn(reader)?;
    server.attach_serial(SerialEventProcessor::new(driver, &config.serial), events)?;

    info!(
        "Dashboard: http://{}/  WebSocket: ws://{}/",
        config.access_point.gateway, config.access_point.gateway
    );

    server.run().await?;
    anyhow::bail!("relay stopped")
}
