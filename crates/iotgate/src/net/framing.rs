//! Stream Framing
//!
//! TCP carries newline-delimited messages. Clients that send a single JSON
//! object without the trailing newline are still served: a buffered tail that
//! already parses as a complete JSON object counts as a message.

use bytes::{Bytes, BytesMut};
use serde::de::IgnoredAny;

/// Outcome of pulling the next frame off the buffer
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Message(Bytes),
    /// The frame exceeded the size limit and was discarded
    TooLarge(usize),
}

/// Accumulates stream bytes and splits them into messages
#[derive(Debug)]
pub struct LineFramer {
    buf: BytesMut,
    max_message_bytes: usize,
    /// Set after an unterminated oversized frame; input is dropped up to the
    /// next newline
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_message_bytes,
            discarding: false,
        }
    }

    /// Buffer to read socket data into
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, if any
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.discarding {
            match self.buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let _ = self.buf.split_to(pos + 1);
                    self.discarding = false;
                }
                None => {
                    self.buf.clear();
                    return None;
                }
            }
        }

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let message = trim(&line);
            if message.is_empty() {
                continue;
            }
            if message.len() > self.max_message_bytes {
                return Some(Frame::TooLarge(message.len()));
            }
            return Some(Frame::Message(Bytes::copy_from_slice(message)));
        }

        if self.buf.len() > self.max_message_bytes {
            let len = self.buf.len();
            self.buf.clear();
            self.discarding = true;
            return Some(Frame::TooLarge(len));
        }

        let tail = trim(&self.buf);
        if tail.first() == Some(&b'{') && serde_json::from_slice::<IgnoredAny>(tail).is_ok() {
            let message = Bytes::copy_from_slice(tail);
            self.buf.clear();
            return Some(Frame::Message(message));
        }

        None
    }
}

pub(crate) fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}
