//! Version-negotiating frame decoder.
//!
//! The decoder starts in [`WireVersion::AwaitingVersion`]. An `ILMP` announce
//! frame selects the format explicitly; otherwise the first data frame with an
//! all-numeric leading token selects the legacy format. Once selected, the
//! version never changes for the lifetime of the decoder.

use crate::error::ProtocolError;
use crate::frame::{BatchEntry, BatchFrame, Frame, LegacyFrame};
use crate::message::{Message, RefUpdate};
use crate::token::{parse_int, Tokens};
use crate::{FIELD_SEPARATOR, RELEASE_CALLBACK_ID, RETAIN_CALLBACK_ID};
use bytes::Bytes;

/// Negotiated wire format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireVersion {
    /// No announce and no data frame seen yet.
    #[default]
    AwaitingVersion,
    /// Legacy per-message sequencing.
    V1,
    /// Batched multi-callback frames.
    V2,
}

impl WireVersion {
    fn from_announced(version: i64) -> Self {
        if version >= 2 {
            WireVersion::V2
        } else {
            WireVersion::V1
        }
    }
}

/// Decodes frames for one connection.
#[derive(Debug, Default)]
pub struct ProtocolDecoder {
    version: WireVersion,
    sequence: i64,
}

impl ProtocolDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the negotiated wire format.
    pub fn version(&self) -> WireVersion {
        self.version
    }

    /// Returns the last legacy sequence number accepted.
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Forgets the negotiated version and the sequence counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Decodes one frame (terminator already stripped).
    pub fn decode(&mut self, frame: &Bytes) -> Result<Frame, ProtocolError> {
        let mut tokens = Tokens::keep_empty(frame, FIELD_SEPARATOR);
        let leading = tokens.peek().unwrap_or_default();

        match leading {
            b"P" => return Ok(Frame::Pong),
            b"U" => {
                tokens.skip_token();
                return Ok(update_frame(tokens));
            }
            b"ILMP" => {
                tokens.skip_token();
                let version = tokens.next_int("protocol version")?;
                if self.version == WireVersion::AwaitingVersion {
                    self.version = WireVersion::from_announced(version);
                }
                return Ok(Frame::Announce { version });
            }
            _ => {}
        }

        match self.version {
            WireVersion::AwaitingVersion if is_numeric(leading) => {
                self.version = WireVersion::V1;
                self.decode_legacy(frame, tokens)
            }
            WireVersion::AwaitingVersion => Err(ProtocolError::MalformedFrame(format!(
                "unexpected leading token {:?} before version negotiation",
                String::from_utf8_lossy(leading)
            ))),
            WireVersion::V1 => self.decode_legacy(frame, tokens),
            WireVersion::V2 => decode_batch(frame, tokens),
        }
    }

    fn decode_legacy(
        &mut self,
        frame: &Bytes,
        mut tokens: Tokens<'_>,
    ) -> Result<Frame, ProtocolError> {
        let sequence = tokens.next_int("sequence number")?;
        self.sequence += 1;
        if sequence != self.sequence {
            return Err(ProtocolError::SequenceMismatch {
                expected: self.sequence,
                actual: sequence,
            });
        }

        let pageview = tokens.next_bytes("pageview id")?;
        match pageview {
            b"P" => return Ok(Frame::Pong),
            b"U" => return Ok(update_frame(tokens)),
            _ => {}
        }

        let pageview_id = parse_int(pageview);
        let callback_id = tokens.next_int("callback id")?;
        let ref_update = RefUpdate::parse(tokens.next_bytes("refcount update")?);
        let messages = tokens
            .map(|raw| Message::from_raw(slice(frame, raw)))
            .collect();

        Ok(Frame::Legacy(LegacyFrame {
            sequence,
            pageview_id,
            callback_id,
            ref_update,
            messages,
        }))
    }
}

fn decode_batch(frame: &Bytes, mut tokens: Tokens<'_>) -> Result<Frame, ProtocolError> {
    let leading = tokens.next_bytes("leading token")?;
    let pageview_id = match leading.split_first() {
        Some((b'm', id)) if is_pageview_id(id) => parse_int(id),
        _ => return Ok(Frame::Unknown(slice(frame, leading))),
    };

    let mut entries = Vec::new();
    while let Some(callback) = tokens.next() {
        let message = tokens.next();
        if callback.is_empty() && message.is_none() {
            // trailing separator
            break;
        }

        let callback_id = parse_int(callback);
        let message = message.unwrap_or_default();
        entries.push(match callback_id {
            RETAIN_CALLBACK_ID => BatchEntry::Retain {
                callback_id: parse_int(message),
            },
            RELEASE_CALLBACK_ID => BatchEntry::Release {
                callback_id: parse_int(message),
            },
            _ => BatchEntry::Deliver {
                callback_id,
                message: Message::from_raw(slice(frame, message)),
            },
        });
    }

    Ok(Frame::Batch(BatchFrame {
        pageview_id,
        entries,
    }))
}

fn update_frame(mut tokens: Tokens<'_>) -> Frame {
    let url = tokens
        .try_next_str()
        .map(|url| url.into_owned())
        .unwrap_or_default();
    Frame::Update { url }
}

fn is_numeric(token: &[u8]) -> bool {
    !token.is_empty() && token.iter().all(u8::is_ascii_digit)
}

/// Decimal pageview id, optionally negative.
fn is_pageview_id(token: &[u8]) -> bool {
    is_numeric(token.strip_prefix(b"-").unwrap_or(token))
}

fn slice(frame: &Bytes, token: &[u8]) -> Bytes {
    if token.is_empty() {
        Bytes::new()
    } else {
        frame.slice_ref(token)
    }
}
