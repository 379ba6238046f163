//! Protocol error types.

use thiserror::Error;

/// Errors raised while decoding inbound frames.
///
/// Every variant is a protocol fault: the connection that produced it cannot
/// continue decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("token expected: {0}")]
    TokenExpected(&'static str),

    #[error("response id sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: i64, actual: i64 },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}
