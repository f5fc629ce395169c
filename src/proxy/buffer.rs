//! Growable per-session byte buffers.
//!
//! Each session owns one request buffer and one response buffer. Buffers
//! are pre-sized from configuration and grow by doubling when a read
//! saturates them; capacity never shrinks while a session is alive, and
//! pooled buffers keep their growth across sessions.

use bytes::BytesMut;

/// A session buffer: a fixed allocation plus a fill level.
///
/// The backing store is always fully allocated (`data.len()` is the
/// capacity); `size` tracks how much of it holds live bytes.
#[derive(Debug)]
pub struct SessionBuf {
    data: BytesMut,
    size: usize,
}

impl SessionBuf {
    pub fn new(capacity: usize) -> Self {
        let mut data = BytesMut::with_capacity(capacity);
        data.resize(capacity, 0);
        Self { data, size: 0 }
    }

    /// Grow when the buffer is saturated: new capacity = (cap - 1) * 2.
    ///
    /// Must be called before each read so a full buffer always has spare
    /// room for the next chunk.
    pub fn grow_if_full(&mut self) {
        if self.size >= self.data.len() {
            let new_cap = (self.data.len() - 1) * 2;
            self.data.resize(new_cap, 0);
        }
    }

    /// Spare room after the live bytes, for reads to fill.
    pub fn spare(&mut self) -> &mut [u8] {
        let size = self.size;
        &mut self.data[size..]
    }

    /// Record `n` newly read bytes.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.size + n <= self.data.len());
        self.size += n;
    }

    /// The live bytes.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Drop the live bytes but keep the allocation.
    pub fn reset(&mut self) {
        self.size = 0;
    }
}
