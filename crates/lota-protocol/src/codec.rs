//! Client command decoding and heartbeat encoding.
//!
//! Commands are tagged by their first byte. The heartbeat is a counter
//! rendered as decimal text.

use crate::messages::{ClientCommand, Frame, Odometry};
use thiserror::Error;

/// Errors that can occur while decoding a client command.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The frame had no payload.
    #[error("Empty command")]
    Empty,

    /// An odometry command carried fewer than three fields.
    #[error("Odometry command needs 3 fields, got {0}")]
    ShortOdometry(usize),
}

/// Decode a text frame sent by a client.
pub fn decode_client_command(text: &str) -> Result<ClientCommand, CodecError> {
    let bytes = text.as_bytes();
    let (&tag, rest) = bytes.split_first().ok_or(CodecError::Empty)?;

    match tag {
        b'O' => match rest {
            [x, y, r, ..] => Ok(ClientCommand::Odometry(Odometry {
                x: *x,
                y: *y,
                r: *r,
            })),
            _ => Err(CodecError::ShortOdometry(rest.len())),
        },
        b'L' => Ok(ClientCommand::Log(text[1..].to_string())),
        _ => Ok(ClientCommand::Unrecognized {
            tag,
            len: bytes.len(),
        }),
    }
}

/// Heartbeat frame for counter value `count`.
pub fn encode_heartbeat(count: u8) -> Frame {
    Frame::text(count.to_string())
}
