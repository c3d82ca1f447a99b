//! Pooled accumulation buffers.
//!
//! Fragment reassembly rents its accumulation buffers here instead of
//! allocating per message. A rented buffer is owned exclusively by one
//! receive loop until it is restored; restoring clears the contents but
//! keeps the grown capacity, so steady-state reassembly allocates
//! nothing.

use std::sync::Mutex;

use bytes::BytesMut;

/// Default capacity of a freshly rented buffer.
const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;

/// Default number of idle buffers the pool retains.
const DEFAULT_MAX_RETAINED: usize = 8;

/// A pool of reusable byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    block_size: usize,
    max_retained: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE, DEFAULT_MAX_RETAINED)
    }
}

impl BufferPool {
    /// Returns a new pool renting buffers of at least `block_size`
    /// capacity and retaining at most `max_retained` idle buffers.
    #[must_use]
    pub fn new(block_size: usize, max_retained: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            block_size,
            max_retained,
        }
    }

    /// Rents a cleared buffer from the pool, allocating one if none is
    /// idle.
    #[must_use]
    pub fn rent(&self) -> BytesMut {
        let reused = self
            .free
            .lock()
            .map_or(None, |mut free| free.pop());
        reused.unwrap_or_else(|| BytesMut::with_capacity(self.block_size))
    }

    /// Restores a buffer to the pool.
    ///
    /// The contents are discarded. Buffers beyond the retention limit
    /// are dropped instead of retained.
    pub fn restore(&self, mut buffer: BytesMut) {
        buffer.clear();
        if buffer.capacity() < self.block_size {
            buffer.reserve(self.block_size - buffer.capacity());
        }
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.max_retained {
                free.push(buffer);
            }
        }
    }

    /// Number of idle buffers currently retained.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.free.lock().map_or(0, |free| free.len())
    }
}
