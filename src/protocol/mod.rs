//! Message model shared by all device-protocol instances.
//!
//! A complete application message is a correlation key plus an opaque
//! payload. The key is the logical channel, topic or service/action name
//! the appliance's protocol uses; the payload stays raw bytes until a
//! vendor driver decodes it into a typed value.

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::Result;

pub mod envelope;
pub mod key;

pub use envelope::{Envelope, EnvelopeKind};
pub use key::MessageKey;

/// One complete application message received from or destined for an
/// appliance.
///
/// Immutable once constructed; the receive loop hands ownership to the
/// dispatcher exactly once. Clones share the underlying payload buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// The correlation key: logical channel, topic or service/action.
    pub key: MessageKey,

    /// The raw message payload.
    pub payload: Bytes,
}

impl Message {
    /// Returns a new message with the given key and payload.
    #[must_use]
    pub fn new(key: MessageKey, payload: impl Into<Bytes>) -> Self {
        Self {
            key,
            payload: payload.into(),
        }
    }

    /// Decodes the payload into a vendor-typed value.
    ///
    /// # Errors
    ///
    /// Will return `Err` of kind `ProtocolViolation` if the payload does
    /// not deserialize into `T`.
    pub fn decode<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.payload).map_err(Into::into)
    }
}
