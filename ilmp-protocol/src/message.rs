//! Callback messages and refcount updates carried by inbound frames.

use crate::token::{parse_int, Tokens};
use crate::{ESCAPE_MARKER, MESSAGE_SEPARATOR};
use bytes::Bytes;

/// One message addressed to a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// JSON document, with the leading marker byte stripped.
    Json(Bytes),
    /// Parameter list, split on [`MESSAGE_SEPARATOR`] by [`Message::params`].
    Params(Bytes),
}

impl Message {
    /// Classifies a raw message by its first byte.
    pub fn from_raw(raw: Bytes) -> Self {
        if raw.first() == Some(&ESCAPE_MARKER) {
            Message::Json(raw.slice(1..))
        } else {
            Message::Params(raw)
        }
    }

    /// Returns the parameter tokens of the payload (empty fields kept).
    pub fn params(&self) -> Tokens<'_> {
        Tokens::keep_empty(self.payload(), MESSAGE_SEPARATOR)
    }

    pub fn is_json(&self) -> bool {
        matches!(self, Message::Json(_))
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &Bytes {
        match self {
            Message::Json(raw) | Message::Params(raw) => raw,
        }
    }
}

/// Refcount change attached to a legacy frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefUpdate {
    /// Empty token.
    Keep,
    /// `"+"`
    Increment,
    /// `"-"`
    Decrement,
    /// Bare number: absolute count.
    Set(i64),
}

impl RefUpdate {
    pub fn parse(token: &[u8]) -> Self {
        match token {
            b"" => RefUpdate::Keep,
            b"+" => RefUpdate::Increment,
            b"-" => RefUpdate::Decrement,
            other => RefUpdate::Set(parse_int(other)),
        }
    }

    /// Applies the update to a refcount. Relative updates saturate.
    pub fn apply(self, refcount: i64) -> i64 {
        match self {
            RefUpdate::Keep => refcount,
            RefUpdate::Increment => refcount.saturating_add(1),
            RefUpdate::Decrement => refcount.saturating_sub(1),
            RefUpdate::Set(value) => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_classification() {
        let msg = Message::from_raw(Bytes::from_static(b"\x05{\"a\":1}"));
        assert!(msg.is_json());
        assert_eq!(msg.payload().as_ref(), b"{\"a\":1}");

        let msg = Message::from_raw(Bytes::from_static(b"a\x04b\x04"));
        assert!(!msg.is_json());
        let params: Vec<&[u8]> = msg.params().collect();
        assert_eq!(params, vec![&b"a"[..], &b"b"[..], &b""[..]]);
    }

    #[test]
    fn test_empty_message_has_one_empty_param() {
        let msg = Message::from_raw(Bytes::new());
        let params: Vec<&[u8]> = msg.params().collect();
        assert_eq!(params, vec![&b""[..]]);
    }

    #[test]
    fn test_ref_update_parse() {
        assert_eq!(RefUpdate::parse(b""), RefUpdate::Keep);
        assert_eq!(RefUpdate::parse(b"+"), RefUpdate::Increment);
        assert_eq!(RefUpdate::parse(b"-"), RefUpdate::Decrement);
        assert_eq!(RefUpdate::parse(b"3"), RefUpdate::Set(3));
        assert_eq!(RefUpdate::parse(b"0"), RefUpdate::Set(0));
    }

    #[test]
    fn test_ref_update_apply() {
        assert_eq!(RefUpdate::Keep.apply(2), 2);
        assert_eq!(RefUpdate::Increment.apply(2), 3);
        assert_eq!(RefUpdate::Decrement.apply(1), 0);
        assert_eq!(RefUpdate::Set(5).apply(1), 5);
    }

    #[test]
    fn test_ref_update_saturates() {
        let huge = RefUpdate::parse(b"99999999999999999999");
        assert_eq!(huge, RefUpdate::Set(i64::MAX));
        assert_eq!(RefUpdate::Increment.apply(huge.apply(1)), i64::MAX);
        assert_eq!(RefUpdate::Decrement.apply(i64::MIN), i64::MIN);
    }
}
