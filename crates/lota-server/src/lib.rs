//! # lota-server
//!
//! Tokio runtime of the LOTA serial relay.
//!
//! The relay accepts HTTP connections, serves the dashboard files and
//! promotes WebSocket upgrades to long-lived sessions. Data read from the
//! serial link, and a periodic heartbeat counter, are broadcast to every
//! open session.
//!
//! Features:
//! - `embedded-assets` (default) - Bake `static/` into the binary

pub mod admission;
#[cfg(feature = "embedded-assets")]
pub mod assets;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod uart;

pub use admission::{AdmissionQueue, AdmissionWorker, EnqueueError, PendingConnection};
#[cfg(feature = "embedded-assets")]
pub use assets::EmbeddedResources;
pub use dispatch::{DispatchOutcome, Dispatcher, Rewind};
pub use error::{RelayError, Result};
pub use registry::{SessionId, SessionInfo, SessionRegistry, SessionState};
pub use relay::{spawn_heartbeat, BroadcastRelay, HeartbeatCounter};
pub use server::{RelayContext, RelayServer};
pub use session::{LoggingHandler, SessionEvent, SessionHandler};
pub use uart::{process_queued, spawn_serial_processor, SoftUart, UartIngest};

pub use lota_core::{MemoryResources, RelayConfig, SerialConfig};
