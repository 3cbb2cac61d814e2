//! Newline-delimited JSON framing
//!
//! Bytes are appended as they arrive from the socket and complete lines are
//! split off one at a time, so a message may arrive in any number of reads
//! and one read may carry several messages.

use serde_json::Value;

use crate::error::ProtocolError;

/// Longest single message accepted before the connection is dropped
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no newline
    scanned: usize,
    max_line: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received after the last complete line
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete JSON message, skipping blank lines. `None` means more
    /// bytes are needed.
    pub fn next_message(&mut self) -> Option<Result<Value, ProtocolError>> {
        loop {
            let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') else {
                self.scanned = self.buf.len();
                if self.buf.len() > self.max_line {
                    return Some(Err(ProtocolError::LineTooLong { limit: self.max_line }));
                }
                return None;
            };
            let newline = self.scanned + offset;
            self.scanned = 0;

            if newline > self.max_line {
                return Some(Err(ProtocolError::LineTooLong { limit: self.max_line }));
            }
            let line: Vec<u8> = self.buf.drain(..=newline).collect();

            let text = match std::str::from_utf8(&line) {
                Ok(text) => text.trim(),
                Err(_) => return Some(Err(ProtocolError::InvalidUtf8)),
            };
            if text.is_empty() {
                continue;
            }

            return Some(serde_json::from_str(text).map_err(ProtocolError::from));
        }
    }
}
