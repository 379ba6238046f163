//! ILMP frame shapes.
//!
//! Inbound (server to client), one frame per [`FRAME_TERMINATOR`]:
//!
//! ```text
//! v1:  <seq> 02 <pageviewId> 02 <callbackId> 02 <refUpdate> ( 02 <message> )*
//!      <seq> 02 P                      pong
//!      <seq> 02 U [ 02 <url> ]         update demand
//! v2:  ILMP 02 <version>               version announce
//!      P                               pong
//!      U [ 02 <url> ]                  update demand
//!      m<pageviewId> ( 02 <callbackId> 02 <message> )*
//! ```
//!
//! Outbound (client to server):
//!
//! ```text
//! command:   <pageviewId> 02 M<siteDir>|<name> ( 03 <tag><escaped value> )* 01
//! cancel:    <pageviewId> 02 C<callbackId> 01
//! ping:      P 01
//! handshake: GET /ilcs? ILMP/<version> \n\n
//! ```

use crate::codec::escape_into;
use crate::message::{Message, RefUpdate};
use crate::{ARGUMENT_SEPARATOR, FIELD_SEPARATOR, FRAME_TERMINATOR};
use bytes::{BufMut, Bytes, BytesMut};

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Reply to a ping.
    Pong,
    /// The server refuses this client version; `url` may point at an update.
    Update { url: String },
    /// The server announced the wire format it speaks.
    Announce { version: i64 },
    /// Legacy per-message frame.
    Legacy(LegacyFrame),
    /// Batched multi-callback frame.
    Batch(BatchFrame),
    /// A v2 frame with a leading token this client does not know.
    Unknown(Bytes),
}

/// A v1 data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyFrame {
    pub sequence: i64,
    pub pageview_id: i64,
    pub callback_id: i64,
    pub ref_update: RefUpdate,
    pub messages: Vec<Message>,
}

/// A v2 `m<pageviewId>` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFrame {
    pub pageview_id: i64,
    pub entries: Vec<BatchEntry>,
}

/// One (callback id, message) pair of a batch frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEntry {
    /// Deliver `message` to the callback; no refcount change.
    Deliver { callback_id: i64, message: Message },
    /// Increment the refcount of `callback_id`.
    Retain { callback_id: i64 },
    /// Decrement the refcount of `callback_id`.
    Release { callback_id: i64 },
}

/// Builder for one outbound command frame.
///
/// Arguments are appended in order; string payloads are escaped before they
/// are written so they may contain any byte.
#[derive(Debug)]
pub struct CommandFrame {
    buf: BytesMut,
}

impl CommandFrame {
    pub fn new(pageview_id: i64, site_dir: &str, command: &str) -> Self {
        let mut buf = BytesMut::with_capacity(32 + site_dir.len() + command.len());
        buf.put_slice(pageview_id.to_string().as_bytes());
        buf.put_u8(FIELD_SEPARATOR);
        buf.put_u8(b'M');
        buf.put_slice(site_dir.as_bytes());
        buf.put_u8(b'|');
        buf.put_slice(command.as_bytes());
        Self { buf }
    }

    /// Appends an integer (`j` tag).
    pub fn int(&mut self, value: i64) -> &mut Self {
        self.tag(b'j');
        self.buf.put_slice(value.to_string().as_bytes());
        self
    }

    /// Appends a plain string (`p` tag).
    pub fn plain(&mut self, value: &[u8]) -> &mut Self {
        self.tag(b'p');
        escape_into(value, &mut self.buf);
        self
    }

    /// Appends a literal/JSON string (`j` tag).
    pub fn json(&mut self, value: &[u8]) -> &mut Self {
        self.tag(b'j');
        escape_into(value, &mut self.buf);
        self
    }

    /// Appends a callback reference (`c` tag).
    pub fn callback(&mut self, callback_id: i64) -> &mut Self {
        self.tag(b'c');
        self.buf.put_slice(callback_id.to_string().as_bytes());
        self
    }

    /// Terminates the frame.
    pub fn finish(mut self) -> Bytes {
        self.buf.put_u8(FRAME_TERMINATOR);
        self.buf.freeze()
    }

    fn tag(&mut self, tag: u8) {
        self.buf.put_u8(ARGUMENT_SEPARATOR);
        self.buf.put_u8(tag);
    }
}

/// Frame telling the server the client no longer needs a callback.
pub fn cancel_frame(pageview_id: i64, callback_id: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(24);
    buf.put_slice(pageview_id.to_string().as_bytes());
    buf.put_u8(FIELD_SEPARATOR);
    buf.put_u8(b'C');
    buf.put_slice(callback_id.to_string().as_bytes());
    buf.put_u8(FRAME_TERMINATOR);
    buf.freeze()
}

/// Keepalive ping.
pub fn ping_frame() -> Bytes {
    Bytes::from_static(b"P\x01")
}

/// Preamble sent right after the TCP connection is established.
pub fn handshake(client_version: &str) -> Bytes {
    Bytes::from(format!("GET /ilcs? ILMP/{}\n\n", client_version))
}
