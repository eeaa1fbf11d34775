//! Relay configuration.
//!
//! Every tunable of the relay lives here: listener and admission limits,
//! per-connection timeouts, the serial link and the access point. All
//! fields have defaults matching the reference firmware, so a JSON file
//! only needs to name the values it changes.
//!
//! ```json
//! {
//!   "bindAddr": "0.0.0.0:8080",
//!   "maxSessions": 4,
//!   "serial": { "port": "/dev/ttyACM0", "patternChar": "#" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read configuration: {0}")]
    Read(#[from] std::io::Error),

    /// The configuration data is not valid JSON for [`RelayConfig`].
    #[error("Invalid configuration data: {0}")]
    InvalidData(#[from] serde_json::Error),

    /// A field holds a value the relay cannot run with.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    /// Address the HTTP/WebSocket listener binds to.
    pub bind_addr: SocketAddr,

    /// Pending connections the admission queue holds before rejecting.
    pub queue_capacity: usize,

    /// How long the accept loop waits for queue space.
    pub enqueue_timeout_ms: u64,

    /// Workers competing for queued connections.
    pub worker_count: usize,

    /// Bound on the first read of a freshly accepted connection.
    pub read_timeout_ms: u64,

    /// Bound on any single write to a client.
    pub write_timeout_ms: u64,

    /// Maximum number of concurrently open WebSocket sessions.
    pub max_sessions: usize,

    /// Period of the heartbeat counter broadcast.
    pub heartbeat_period_ms: u64,

    /// Upper bound on the buffered request head.
    pub max_request_head: usize,

    /// Serial link settings.
    pub serial: SerialConfig,

    /// Access point settings.
    pub access_point: AccessPointConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            queue_capacity: 10,
            enqueue_timeout_ms: 500,
            worker_count: 1,
            read_timeout_ms: 1000,
            write_timeout_ms: 1000,
            max_sessions: 10,
            heartbeat_period_ms: 1000,
            max_request_head: 2048,
            serial: SerialConfig::default(),
            access_point: AccessPointConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Parse and validate a configuration from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queueCapacity", "must be at least 1"));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::invalid("workerCount", "must be at least 1"));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::invalid("maxSessions", "must be at least 1"));
        }
        if self.heartbeat_period_ms == 0 {
            return Err(ConfigError::invalid("heartbeatPeriodMs", "must be non-zero"));
        }
        if self.read_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(ConfigError::invalid("timeouts", "must be non-zero"));
        }
        if self.max_request_head < 16 {
            return Err(ConfigError::invalid("maxRequestHead", "must be at least 16 bytes"));
        }
        self.serial.validate()?;
        self.access_point.validate()
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

/// Serial link configuration.
///
/// The defaults describe the fixed link of the reference board:
/// 115200 baud, 8N1, no flow control, pattern `+++`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SerialConfig {
    /// Device path (host) or UART name (ESP32).
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    pub flow_control: FlowControl,

    /// Marker byte of the in-band control pattern.
    pub pattern_char: char,

    /// Consecutive marker bytes forming one pattern.
    pub pattern_len: usize,

    /// Pattern positions tracked before detection reports an exhausted queue.
    pub pattern_queue_len: usize,

    /// Receive ring buffer size in bytes.
    pub rx_buffer_size: usize,

    /// Driver events buffered before the hardware FIFO is considered overrun.
    pub event_queue_len: usize,

    /// Write received data back to the serial transmitter.
    pub echo: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            flow_control: FlowControl::None,
            pattern_char: '+',
            pattern_len: 3,
            pattern_queue_len: 20,
            rx_buffer_size: 2048,
            event_queue_len: 20,
            echo: true,
        }
    }
}

impl SerialConfig {
    /// The marker as a raw byte.
    ///
    /// Validation guarantees the marker is ASCII.
    pub fn pattern_byte(&self) -> u8 {
        u8::try_from(self.pattern_char).unwrap_or(b'+')
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::invalid("serial.baudRate", "must be non-zero"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ConfigError::invalid("serial.dataBits", "must be 5 to 8"));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(ConfigError::invalid("serial.stopBits", "must be 1 or 2"));
        }
        if !self.pattern_char.is_ascii() {
            return Err(ConfigError::invalid("serial.patternChar", "must be ASCII"));
        }
        if self.pattern_len == 0 || self.pattern_len > 16 {
            return Err(ConfigError::invalid("serial.patternLen", "must be 1 to 16"));
        }
        if self.pattern_queue_len == 0 {
            return Err(ConfigError::invalid("serial.patternQueueLen", "must be at least 1"));
        }
        if self.rx_buffer_size < 128 {
            return Err(ConfigError::invalid("serial.rxBufferSize", "must be at least 128 bytes"));
        }
        if self.event_queue_len == 0 {
            return Err(ConfigError::invalid("serial.eventQueueLen", "must be at least 1"));
        }
        Ok(())
    }
}

/// Wireless access point configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessPointConfig {
    pub ssid: String,

    /// WPA2 passphrase; empty for an open network.
    pub password: String,
    pub channel: u8,
    pub max_connections: u16,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            ssid: "LOTA".to_string(),
            password: "opensesame".to_string(),
            channel: 1,
            max_connections: 4,
            gateway: Ipv4Addr::new(192, 168, 4, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
        }
    }
}

impl AccessPointConfig {
    /// Whether stations join without a passphrase.
    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssid.is_empty() || self.ssid.len() > 32 {
            return Err(ConfigError::invalid("accessPoint.ssid", "must be 1 to 32 bytes"));
        }
        if !self.is_open() && !(8..=64).contains(&self.password.len()) {
            return Err(ConfigError::invalid(
                "accessPoint.password",
                "must be empty or 8 to 64 bytes",
            ));
        }
        if !(1..=13).contains(&self.channel) {
            return Err(ConfigError::invalid("accessPoint.channel", "must be 1 to 13"));
        }
        Ok(())
    }
}
