//! Stream framing and payload escaping.

use crate::{ESCAPE_MARKER, FRAME_TERMINATOR};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt::Write;

/// Accumulates bytes read from the transport and hands out complete frames.
///
/// Frames are the ranges between [`FRAME_TERMINATOR`] bytes. Repeated
/// terminators never produce empty frames, and bytes are released as soon as
/// the frame containing them is taken.
pub struct FrameBuffer {
    buffer: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_capacity(8192)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Mutable access to the buffer, for reading directly into it.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Takes the next complete frame (without its terminator).
    ///
    /// Returns `None` if the buffer holds no complete frame yet.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            let pos = self.buffer.iter().position(|&b| b == FRAME_TERMINATOR)?;
            let frame = self.buffer.split_to(pos).freeze();
            self.buffer.advance(1);
            if !frame.is_empty() {
                return Some(frame);
            }
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Escapes a payload so it can travel inside a frame.
///
/// Every byte in `0x00..=0x05` becomes [`ESCAPE_MARKER`] followed by the ASCII
/// digit of its value; all other bytes pass through.
pub fn escape(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    escape_into(payload, &mut out);
    out
}

/// Escapes `payload`, appending the result to `out`.
pub fn escape_into<B: BufMut>(payload: &[u8], out: &mut B) {
    for &b in payload {
        if b <= ESCAPE_MARKER {
            out.put_u8(ESCAPE_MARKER);
            out.put_u8(b'0' + b);
        } else {
            out.put_u8(b);
        }
    }
}

/// Reverses [`escape`].
///
/// An escape marker followed by anything other than `'0'..='5'`, or at the
/// very end of the input, is kept as-is.
pub fn unescape(escaped: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut iter = escaped.iter().copied().peekable();
    while let Some(b) = iter.next() {
        if b == ESCAPE_MARKER {
            if let Some(&digit) = iter.peek() {
                if (b'0'..=b'0' + ESCAPE_MARKER).contains(&digit) {
                    iter.next();
                    out.push(digit - b'0');
                    continue;
                }
            }
        }
        out.push(b);
    }
    out
}

/// Renders wire bytes for logs, showing control bytes as ` [00N] `.
pub fn readable(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        if b <= 0x08 {
            let _ = write!(out, " [{:03}] ", b);
        } else if b.is_ascii() {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "\\x{:02x}", b);
        }
    }
    out
}
