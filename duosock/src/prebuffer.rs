//! Staging buffer for bytes received ahead of the read that needs them
//!
//! Raw socket reads and decrypted TLS records land here first; read packets
//! take what they need from the front. Once fully drained the store is
//! reset, and its capacity trimmed back, so a burst under backpressure
//! does not pin memory for the socket's lifetime.

use std::io;

/// Capacity kept across resets
const RETAINED_CAPACITY: usize = 64 * 1024;

/// Byte store with separate read and write cursors
#[derive(Debug, Default)]
pub struct PreBuffer {
    // bytes [read..buf.len()) are unread; buf.len() is the write cursor
    buf: Vec<u8>,
    read: usize,
}

impl PreBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            read: 0,
        }
    }

    /// Number of unread bytes
    pub fn available(&self) -> usize {
        self.buf.len() - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Unread bytes
    pub fn readable(&self) -> &[u8] {
        &self.buf[self.read..]
    }

    /// Let `fill` write up to `max` bytes at the write cursor
    ///
    /// Only the byte count `fill` reports is kept.
    pub fn fill_with<F>(&mut self, max: usize, fill: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        self.compact();
        let start = self.buf.len();
        self.buf.resize(start + max, 0);
        match fill(&mut self.buf[start..]) {
            Ok(n) => {
                self.buf.truncate(start + n.min(max));
                Ok(n)
            }
            Err(e) => {
                self.buf.truncate(start);
                Err(e)
            }
        }
    }

    /// Append bytes at the write cursor
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.compact();
        self.buf.extend_from_slice(data);
    }

    /// Advance the read cursor by `n` bytes
    pub fn consume(&mut self, n: usize) {
        self.read += n.min(self.available());
        if self.read == self.buf.len() {
            self.reset();
        }
    }

    /// Move `n` unread bytes into `out`
    pub fn drain_into(&mut self, n: usize, out: &mut Vec<u8>) -> usize {
        let n = n.min(self.available());
        out.extend_from_slice(&self.buf[self.read..self.read + n]);
        self.consume(n);
        n
    }

    /// Discard everything
    pub fn reset(&mut self) {
        self.buf.clear();
        self.read = 0;
        if self.buf.capacity() > RETAINED_CAPACITY {
            self.buf.shrink_to(RETAINED_CAPACITY);
        }
    }

    /// Drop the consumed prefix once it outweighs the unread bytes
    fn compact(&mut self) {
        if self.read > 0 && self.read >= self.available() {
            self.buf.drain(..self.read);
            self.read = 0;
        }
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}
