//! Wi-Fi access point for ESP32.
//!
//! The relay runs its own network: stations join the `LOTA` access point
//! and browse to the gateway address.

use anyhow::{anyhow, bail, Result};
use esp_idf_svc::{
    eventloop::{EspSubscription, EspSystemEventLoop, System},
    hal::peripheral,
    nvs::EspDefaultNvsPartition,
    wifi::{AccessPointConfiguration, AuthMethod, BlockingWifi, Configuration, EspWifi, WifiEvent},
};
use log::info;

use lota_core::{log_access_point_event, AccessPointConfig, AccessPointEvent, MacAddress};

/// Bring up the access point described by `config`.
///
/// Returns the `EspWifi` instance, which must be kept alive for the access
/// point to stay up.
pub fn start_access_point(
    config: &AccessPointConfig,
    modem: impl peripheral::Peripheral<P = esp_idf_svc::hal::modem::Modem> + 'static,
    sysloop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
) -> Result<Box<EspWifi<'static>>> {
    if config.ssid.is_empty() {
        bail!("Access point SSID cannot be empty");
    }

    let auth_method = if config.is_open() {
        info!("Access point password is empty, using open network");
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };

    let mut esp_wifi = EspWifi::new(modem, sysloop.clone(), Some(nvs))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sysloop)?;

    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: config
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("SSID too long (max 32 chars)"))?,
        password: config
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("Password too long (max 64 chars)"))?,
        channel: config.channel,
        auth_method,
        max_connections: config.max_connections,
        ..Default::default()
    }))?;

    wifi.start()?;
    wifi.wait_netif_up()?;

    let ip_info = wifi.wifi().ap_netif().get_ip_info()?;
    info!("Access point '{}' up on channel {}", config.ssid, config.channel);
    info!("  Gateway:    {}", ip_info.ip);
    info!("  Netmask:    {}", ip_info.subnet.mask);

    Ok(Box::new(esp_wifi))
}

/// Translate a driver event into the relay's access point vocabulary.
pub fn access_point_event(event: &WifiEvent) -> Option<AccessPointEvent> {
    match event {
        WifiEvent::ApStarted => Some(AccessPointEvent::Started),
        WifiEvent::ApStopped => Some(AccessPointEvent::Stopped),
        WifiEvent::ApProbeRequestReceived => Some(AccessPointEvent::ProbeReceived),
        WifiEvent::ApStaConnected(station) => Some(AccessPointEvent::StationConnected {
            mac: MacAddress(station.mac()),
            aid: station.aid(),
        }),
        WifiEvent::ApStaDisconnected(station) => Some(AccessPointEvent::StationDisconnected {
            mac: MacAddress(station.mac()),
            aid: station.aid(),
        }),
        _ => None,
    }
}

/// Log access point events for as long as the returned subscription lives.
pub fn subscribe_ap_events(sysloop: &EspSystemEventLoop) -> Result<EspSubscription<'static, System>> {
    let subscription = sysloop.subscribe::<WifiEvent, _>(|event| {
        if let Some(event) = access_point_event(&event) {
            log_access_point_event(&event);
        }
    })?;
    Ok(subscription)
}
