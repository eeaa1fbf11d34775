//! Access point notifications.
//!
//! The radio driver that runs the access point lives outside this crate.
//! It reports station activity as [`AccessPointEvent`]s, which the relay
//! only logs.

use std::fmt;
use tracing::{debug, info};

/// A station's hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }
}

/// Notification from the wireless access point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPointEvent {
    Started,
    Stopped,
    ProbeReceived,
    StationConnected { mac: MacAddress, aid: u16 },
    StationDisconnected { mac: MacAddress, aid: u16 },
    /// Any other driver event, by its raw id.
    Other(i32),
}

/// Log an access point notification.
pub fn log_access_point_event(event: &AccessPointEvent) {
    match event {
        AccessPointEvent::Started => info!(target: "wifi_ap", "Access point started"),
        AccessPointEvent::Stopped => info!(target: "wifi_ap", "Access point stopped"),
        AccessPointEvent::ProbeReceived => {
            debug!(target: "wifi_ap", "Probe request received")
        }
        AccessPointEvent::StationConnected { mac, aid } => {
            info!(target: "wifi_ap", "Station {} joined, AID={}", mac, aid)
        }
        AccessPointEvent::StationDisconnected { mac, aid } => {
            info!(target: "wifi_ap", "Station {} left, AID={}", mac, aid)
        }
        AccessPointEvent::Other(id) => debug!(target: "wifi_ap", "Unhandled event id {}", id),
    }
}
