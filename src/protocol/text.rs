//! Text framing (v1).
//!
//! Every message is one JSON object terminated by a line feed.  A
//! frame is only handed on once its whole line has arrived and parsed;
//! there is no fragmentation and no flow control.  An empty object is
//! a keepalive.

use tracing::trace;

use super::message::{Inbound, Message, WireMessage};
use crate::error::FrameError;

/// Accumulates bytes and yields one message per complete line.
#[derive(Debug)]
pub struct TextDecoder {
    buf: Vec<u8>,
    max_line: usize,
}

impl TextDecoder {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete message, `Ok(None)` when more bytes are needed.
    /// Malformed lines are consumed before the error is returned so
    /// decoding can resume on the next line.
    pub fn next_inbound(&mut self) -> Result<Option<Inbound>, FrameError> {
        loop {
            let Some(end) = self.buf.iter().position(|b| *b == b'\n') else {
                if self.buf.len() > self.max_line {
                    return Err(FrameError::TooLarge {
                        size: self.buf.len(),
                        limit: self.max_line,
                    });
                }
                return Ok(None);
            };
            let line: Vec<u8> = self.buf.drain(..=end).collect();
            let line = trim_ascii(&line);
            if line.is_empty() {
                continue;
            }
            if line.len() > self.max_line {
                return Err(FrameError::TooLarge {
                    size: line.len(),
                    limit: self.max_line,
                });
            }
            trace!(len = line.len(), "decoded text frame");
            let wire: WireMessage = serde_json::from_slice(line)?;
            return wire.into_inbound().map(Some);
        }
    }
}

/// Encodes messages as newline-terminated JSON.
#[derive(Debug, Default, Clone)]
pub struct TextEncoder;

impl TextEncoder {
    pub fn encode(&self, msg: &Message) -> Result<Vec<u8>, FrameError> {
        let mut out = serde_json::to_vec(&WireMessage::from(msg))?;
        out.push(b'\n');
        Ok(out)
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}
