//! # lota-protocol
//!
//! Wire vocabulary of the LOTA relay.
//!
//! This crate defines:
//! - Request-head parsing and route classification for freshly accepted
//!   connections
//! - Response heads for static replies
//! - Application frames exchanged with WebSocket sessions
//! - The short text commands clients send back

pub mod codec;
pub mod http;
pub mod messages;

pub use codec::{decode_client_command, encode_heartbeat, CodecError};
pub use http::{
    classify, classify_bytes, is_head_complete, response_head, route_for, Method, ParseError,
    RequestHead, Route, Status,
};
pub use messages::*;
