//! Fragment reassembly.
//!
//! Transports deliver application messages in one or more fragments.
//! The [`Reassembler`] concatenates fragments into complete messages:
//! a lone final fragment passes through without copying, while
//! multi-fragment messages accumulate in a buffer rented from the
//! [`BufferPool`](crate::pool::BufferPool) and released as soon as the
//! message is complete or the accumulation is aborted.
//!
//! No message-size limit is enforced here; transports impose their own
//! limits before fragments reach this point.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::pool::BufferPool;

/// Accumulates transport fragments into complete messages.
///
/// Owned exclusively by one session's receive loop.
#[derive(Debug)]
pub struct Reassembler {
    pool: Arc<BufferPool>,
    partial: Option<BytesMut>,
}

impl Reassembler {
    /// Returns a new reassembler renting from `pool`.
    #[must_use]
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            partial: None,
        }
    }

    /// Feeds one fragment; returns the complete message when `is_final`
    /// closes it.
    ///
    /// A final fragment with nothing accumulated is returned as the
    /// message itself, without copying.
    pub fn push(&mut self, fragment: Bytes, is_final: bool) -> Option<Bytes> {
        if is_final && self.partial.is_none() {
            return Some(fragment);
        }

        let pool = &self.pool;
        let buffer = self.partial.get_or_insert_with(|| pool.rent());
        buffer.extend_from_slice(&fragment);

        if !is_final {
            return None;
        }

        // Accumulation complete: copy out the message and restore the
        // buffer so its grown capacity is reused for the next one.
        let buffer = self.partial.take()?;
        let message = Bytes::copy_from_slice(&buffer);
        self.pool.restore(buffer);
        Some(message)
    }

    /// Discards a partial accumulation, returning its buffer to the
    /// pool.
    ///
    /// Called when the connection closes mid-message; the partial bytes
    /// never surface as a message.
    pub fn abort(&mut self) {
        if let Some(buffer) = self.partial.take() {
            self.pool.restore(buffer);
        }
    }

    /// Whether a message is currently being accumulated.
    #[must_use]
    pub fn is_accumulating(&self) -> bool {
        self.partial.is_some()
    }
}

impl Drop for Reassembler {
    fn drop(&mut self) {
        self.abort();
    }
}
