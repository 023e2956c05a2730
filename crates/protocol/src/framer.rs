//! Newline framing over a growing byte buffer
//!
//! Socket reads land in [`LineFramer::buffer_mut`]; complete lines are split
//! off the front. A line that grows past the limit without a newline is
//! reported once and then skipped up to its terminating newline, so memory
//! stays bounded on a misbehaving producer.

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;

/// Initial read buffer capacity (8KB)
const INITIAL_CAPACITY: usize = 8192;

pub struct LineFramer {
    buf: BytesMut,
    max_line_len: usize,
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_line_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            max_line_len,
            discarding: false,
        }
    }

    /// Change the line limit without losing buffered bytes. Used when a
    /// connection moves from handshake to data frames.
    pub fn set_max_line_len(&mut self, max_line_len: usize) {
        self.max_line_len = max_line_len;
    }

    pub fn max_line_len(&self) -> usize {
        self.max_line_len
    }

    /// Buffer to read socket bytes into.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered after the last complete line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete line without its `\n` (and trailing `\r`), or `None`
    /// when only a partial line is buffered.
    pub fn next_line(&mut self) -> Option<Result<Bytes, ProtocolError>> {
        loop {
            match self.buf.iter().position(|b| *b == b'\n') {
                Some(idx) => {
                    let mut line = self.buf.split_to(idx + 1);
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    line.truncate(idx);
                    if line.last() == Some(&b'\r') {
                        line.truncate(idx - 1);
                    }
                    if line.len() > self.max_line_len {
                        return Some(Err(ProtocolError::LineTooLong {
                            limit: self.max_line_len,
                        }));
                    }
                    return Some(Ok(line.freeze()));
                }
                None => {
                    if self.discarding {
                        self.buf.clear();
                    } else if self.buf.len() > self.max_line_len {
                        self.buf.clear();
                        self.discarding = true;
                        return Some(Err(ProtocolError::LineTooLong {
                            limit: self.max_line_len,
                        }));
                    }
                    return None;
                }
            }
        }
    }
}
