//! Application frames and client commands.
//!
//! Sessions exchange [`Frame`]s with the relay. Outbound frames carry serial
//! data and the heartbeat counter; inbound text frames carry short commands
//! identified by their first byte (see [`ClientCommand`]).

use std::fmt;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client sent a close frame.
    External,
    /// The connection ended without a close frame.
    Internal,
    /// Reading from the connection failed.
    Error,
}

/// Kind of application frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
    Ping,
    Pong,
    Connect,
    Disconnect(DisconnectReason),
}

/// An inbound or outbound application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(FrameKind::Text, text.into().into_bytes())
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameKind::Binary, bytes)
    }

    /// Frame for raw serial bytes: text when they are valid UTF-8, binary
    /// otherwise.
    pub fn from_serial(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Self::text(text),
            Err(e) => Self::binary(e.into_bytes()),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload as text, for text frames.
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            FrameKind::Text => std::str::from_utf8(&self.payload).ok(),
            _ => None,
        }
    }
}

/// Odometry sample sent by a client: three raw single-byte fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Odometry {
    pub x: u8,
    pub y: u8,
    pub r: u8,
}

impl fmt::Display for Odometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "X: {} Y: {} R: {}",
            char::from(self.x),
            char::from(self.y),
            char::from(self.r)
        )
    }
}

/// Text command sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Tag `O`.
    Odometry(Odometry),
    /// Tag `L`; the rest of the frame is the message.
    Log(String),
    /// Any other tag. Logged, never rejected.
    Unrecognized { tag: u8, len: usize },
}
