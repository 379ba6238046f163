//! # ilmp-client
//!
//! Async client engine for ILMP.
//!
//! This crate provides:
//! - Connection lifecycle over a single TCP stream (resolve, connect, handshake)
//! - Refcounted callback registry addressed by (pageview id, callback id)
//! - Command builder with typed arguments and callback registration
//! - Ping/pong keepalive and one-shot fault reporting

pub mod callback;
pub mod command;
pub mod connection;
mod dispatch;
pub mod error;
mod keepalive;
pub mod registry;

pub use callback::{from_fn, from_json_fn, Callback, FnCallback, JsonCallback};
pub use command::Command;
pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use error::{ClientError, Fault, FaultKind};
pub use ilmp_protocol::{Tokens, WireVersion};
pub use keepalive::DEFAULT_PING_INTERVAL;
pub use registry::{CallbackHandle, CallbackInfo};
