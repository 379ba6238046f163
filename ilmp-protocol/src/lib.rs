//! # ilmp-protocol
//!
//! Wire protocol implementation for ILMP (Implicit Link Messaging Protocol).
//!
//! This crate provides:
//! - Control-byte framing and tokenization of the inbound byte stream
//! - Payload escaping for outbound command arguments
//! - Outbound frame builders (commands, cancels, pings, handshake)
//! - The version-negotiating decoder for the legacy (v1) and batched (v2) formats
//!
//! Nothing in here performs I/O; the client crate feeds bytes in and writes
//! the produced frames out.

pub mod codec;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod message;
pub mod token;

pub use codec::{escape, escape_into, readable, unescape, FrameBuffer};
pub use decoder::{ProtocolDecoder, WireVersion};
pub use error::ProtocolError;
pub use frame::{
    cancel_frame, handshake, ping_frame, BatchEntry, BatchFrame, CommandFrame, Frame, LegacyFrame,
};
pub use message::{Message, RefUpdate};
pub use token::{parse_int, Tokens};

/// Terminates every frame, in both directions.
pub const FRAME_TERMINATOR: u8 = 0x01;

/// Separates the positional fields of a frame.
pub const FIELD_SEPARATOR: u8 = 0x02;

/// Separates the arguments of an outbound command.
pub const ARGUMENT_SEPARATOR: u8 = 0x03;

/// Separates the parameters inside one callback message.
pub const MESSAGE_SEPARATOR: u8 = 0x04;

/// Starts a two-byte escape sequence in outbound payloads. As the first byte
/// of an inbound message it marks a JSON payload instead.
pub const ESCAPE_MARKER: u8 = 0x05;

/// Protocol version advertised in the handshake.
pub const CLIENT_PROTOCOL_VERSION: &str = "2.0";

/// Default port for ILMP servers.
pub const DEFAULT_PORT: u16 = 80;

/// Reserved v2 callback id: increment the refcount of the callback named by
/// the message payload.
pub const RETAIN_CALLBACK_ID: i64 = -3;

/// Reserved v2 callback id: decrement the refcount of the callback named by
/// the message payload, destroying it at zero.
pub const RELEASE_CALLBACK_ID: i64 = -4;
