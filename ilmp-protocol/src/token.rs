//! Delimiter tokenizer.
//!
//! A [`Tokens`] walks a byte slice and yields the ranges between occurrences
//! of a single delimiter byte. Two emptiness policies exist:
//!
//! - drop empty tokens, for splitting where repeated delimiters must not
//!   produce phantom entries;
//! - keep empty tokens, for positional fields where an absent field means
//!   "empty", not "missing".
//!
//! Typed extraction is lenient (`"abc"` reads as integer `0`). Only the
//! required `next_*` variants fail, with [`ProtocolError::TokenExpected`].

use crate::error::ProtocolError;
use std::borrow::Cow;

/// Forward-only token walker over a byte slice.
#[derive(Debug, Clone)]
pub struct Tokens<'a> {
    rest: Option<&'a [u8]>,
    delimiter: u8,
    keep_empty: bool,
}

impl<'a> Tokens<'a> {
    /// Splits `source` on `delimiter`, skipping empty tokens.
    pub fn new(source: &'a [u8], delimiter: u8) -> Self {
        Self {
            rest: Some(source),
            delimiter,
            keep_empty: false,
        }
    }

    /// Splits `source` on `delimiter`, yielding empty tokens as well.
    ///
    /// An empty source yields exactly one empty token.
    pub fn keep_empty(source: &'a [u8], delimiter: u8) -> Self {
        Self {
            rest: Some(source),
            delimiter,
            keep_empty: true,
        }
    }

    /// Returns the next token without consuming it.
    pub fn peek(&self) -> Option<&'a [u8]> {
        self.clone().next()
    }

    /// Returns whether any token remains.
    pub fn has_next(&self) -> bool {
        self.peek().is_some()
    }

    /// Consumes one token. Returns false if none remained.
    pub fn skip_token(&mut self) -> bool {
        self.next().is_some()
    }

    /// Reads the next token as an integer, or `None` if no token remains.
    pub fn try_next_int(&mut self) -> Option<i64> {
        self.next().map(parse_int)
    }

    /// Reads the next token as a (lossy UTF-8) string, or `None` if no token
    /// remains.
    pub fn try_next_str(&mut self) -> Option<Cow<'a, str>> {
        self.next().map(String::from_utf8_lossy)
    }

    /// Reads the next token as an integer.
    pub fn next_int(&mut self, field: &'static str) -> Result<i64, ProtocolError> {
        self.try_next_int().ok_or(ProtocolError::TokenExpected(field))
    }

    /// Reads the next token as a (lossy UTF-8) string.
    pub fn next_str(&mut self, field: &'static str) -> Result<Cow<'a, str>, ProtocolError> {
        self.try_next_str().ok_or(ProtocolError::TokenExpected(field))
    }

    /// Reads the next raw token.
    pub fn next_bytes(&mut self, field: &'static str) -> Result<&'a [u8], ProtocolError> {
        self.next().ok_or(ProtocolError::TokenExpected(field))
    }
}

impl<'a> Iterator for Tokens<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        loop {
            let rest = self.rest?;
            let token = match rest.iter().position(|&b| b == self.delimiter) {
                Some(pos) => {
                    self.rest = Some(&rest[pos + 1..]);
                    &rest[..pos]
                }
                None => {
                    self.rest = None;
                    rest
                }
            };

            if token.is_empty() && !self.keep_empty {
                continue;
            }
            return Some(token);
        }
    }
}

/// Parses a decimal integer the lenient way.
///
/// Leading ASCII whitespace and one sign are accepted, digits are read up to
/// the first non-digit, anything unparseable yields `0`. Overflow saturates.
pub fn parse_int(token: &[u8]) -> i64 {
    let mut bytes = token
        .iter()
        .copied()
        .skip_while(|b| b.is_ascii_whitespace())
        .peekable();

    let negative = match bytes.peek() {
        Some(b'-') => {
            bytes.next();
            true
        }
        Some(b'+') => {
            bytes.next();
            false
        }
        _ => false,
    };

    let mut value: i64 = 0;
    for b in bytes.take_while(u8::is_ascii_digit) {
        let digit = i64::from(b - b'0');
        value = value.saturating_mul(10).saturating_add(digit);
    }

    if negative {
        -value
    } else {
        value
    }
}
