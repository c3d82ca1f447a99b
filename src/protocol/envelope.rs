//! Default JSON wire envelope.
//!
//! The WebSocket appliance families wrap every message in a small JSON
//! envelope: a stanza type, the correlation key and an arbitrary JSON
//! payload. Pub/sub families carry the key in the topic instead and do
//! not use this envelope; their drivers supply their own
//! [`Connector`](crate::transport::Connector).
//!
//! # Wire Format
//!
//! ```json
//! {
//!     "type": "request",
//!     "key": "audio/getVolume",
//!     "payload": { "subscribe": false }
//! }
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Message, MessageKey};
use crate::error::Result;

/// Stanza types on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// A request sent from the client.
    Request,

    /// A reply to an earlier request on the same key.
    Response,

    /// An unsolicited push notification.
    Event,
}

/// A message envelope on a device websocket.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct Envelope {
    /// The stanza type.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,

    /// The correlation key.
    pub key: MessageKey,

    /// The message payload. Defaults to JSON `null` when absent.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    /// Returns a new request envelope.
    #[must_use]
    pub fn request(key: MessageKey, payload: Value) -> Self {
        Self {
            kind: EnvelopeKind::Request,
            key,
            payload,
        }
    }

    /// Serializes the envelope into a wire frame.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the payload cannot be serialized.
    pub fn to_frame(&self) -> Result<Bytes> {
        let frame = serde_json::to_vec(self)?;
        Ok(Bytes::from(frame))
    }

    /// Parses a complete wire frame into an `Envelope`.
    ///
    /// # Errors
    ///
    /// Will return `Err` of kind `ProtocolViolation` if the frame is not
    /// a valid envelope.
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame).map_err(Into::into)
    }

    /// Converts the envelope into a [`Message`], re-serializing the
    /// payload as raw bytes for the vendor decode seam.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the payload cannot be serialized.
    pub fn into_message(self) -> Result<Message> {
        let payload = serde_json::to_vec(&self.payload)?;
        Ok(Message::new(self.key, payload))
    }
}
