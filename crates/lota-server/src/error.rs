//! Relay error types.

use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors raised by the relay server.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Socket I/O on a single connection failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// WebSocket protocol or handshake failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// A bounded read or write did not complete in time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The session registry is at capacity.
    #[error("Session limit of {0} reached")]
    SessionLimit(usize),

    /// The listener could not accept. The process must restart.
    #[error("Listener failed: {0}")]
    Listener(io::Error),

    /// Every worker is gone.
    #[error("Admission queue closed")]
    QueueClosed,

    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] lota_core::ConfigError),
}

impl RelayError {
    /// Whether the error only affects one connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RelayError::Io(_)
                | RelayError::WebSocket(_)
                | RelayError::Timeout(_)
                | RelayError::SessionLimit(_)
        )
    }

    /// Whether the whole relay must be restarted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Listener(_) | RelayError::QueueClosed)
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
