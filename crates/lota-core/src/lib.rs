//! # lota-core
//!
//! Core building blocks of the LOTA serial relay.
//!
//! This crate provides:
//! - Relay configuration (network, serial link, access point)
//! - The serial event model and its processor
//! - In-band marker pattern scanning
//! - Access point notifications
//! - The static resource model served by the dashboard
//!
//! This crate is intentionally runtime-agnostic and contains no async code,
//! making it usable on both Linux (tokio) and ESP32 (esp-idf) targets.

pub mod ap;
pub mod config;
pub mod resources;
pub mod serial;

pub use ap::{log_access_point_event, AccessPointEvent, MacAddress};
pub use config::{
    AccessPointConfig, ConfigError, FlowControl, Parity, RelayConfig, SerialConfig,
};
pub use resources::{content_type_for, Asset, MemoryResources, Resource, ResourceStore};
pub use serial::{
    PatternScanner, QueuedEvent, ScanItem, SerialDriver, SerialError, SerialEvent,
    SerialEventProcessor, SerialOutcome,
};
