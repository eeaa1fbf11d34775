//! ESP32-specific components for the LOTA relay.
//!
//! This crate provides:
//! - The Wi-Fi access point the dashboard is served on
//! - Translation of access point driver events into [`AccessPointEvent`]s
//! - `std::io` adapters over the ESP-IDF UART driver, so the host-side
//!   software UART can run unchanged on the device
//!
//! # Example
//!
//! ```ignore
//! use lota_esp32::wifi::{start_access_point, subscribe_ap_events};
//! use lota_esp32::uart::open_uart;
//!
//! let _events = subscribe_ap_events(&sysloop)?;
//! let _wifi = start_access_point(&config.access_point, peripherals.modem, sysloop, nvs)?;
//! let (reader, writer) = open_uart(&config.serial, peripherals.uart1, pins.gpio4, pins.gpio5)?;
//! ```
//!
//! [`AccessPointEvent`]: lota_core::AccessPointEvent

pub mod uart;
pub mod wifi;
