//! Fault and client error types.

use ilmp_protocol::ProtocolError;
use std::fmt;
use thiserror::Error;

/// Category of a fault surfaced through the error notification.
///
/// The numeric codes are stable and match the ones legacy clients report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Resolution failure, all endpoints exhausted, read/write failure or
    /// ping/pong timeout.
    Network,
    /// Sequence mismatch or malformed frame.
    Protocol,
    /// The server demands a client update.
    ProtocolVersion,
}

impl FaultKind {
    pub fn code(&self) -> i32 {
        match self {
            FaultKind::Network => 1,
            FaultKind::Protocol => 2,
            FaultKind::ProtocolVersion => 3,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Network => write!(f, "NETWORK"),
            FaultKind::Protocol => write!(f, "PROTOCOL"),
            FaultKind::ProtocolVersion => write!(f, "PROTOCOL_VERSION"),
        }
    }
}

/// A fault delivered to the connection's error hook.
///
/// For [`FaultKind::ProtocolVersion`] the message is the update URL sent by
/// the server (possibly empty).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Network, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Protocol, message)
    }

    pub fn protocol_version(update_url: impl Into<String>) -> Self {
        Self::new(FaultKind::ProtocolVersion, update_url)
    }
}

impl From<ProtocolError> for Fault {
    fn from(err: ProtocolError) -> Self {
        Fault::protocol(err.to_string())
    }
}

/// Errors returned synchronously by the client API.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
