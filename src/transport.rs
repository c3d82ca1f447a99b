//! Transport abstraction.
//!
//! A session talks to its appliance through three object-safe traits:
//! a [`Connector`] performs the handshake and supplies the
//! protocol-specific frame codec, and the resulting
//! [`TransportSink`]/[`TransportStream`] pair carries frames in each
//! direction. The split mirrors the independent read/write halves of
//! the underlying socket: the sink is serialized behind a lock, the
//! stream is owned by the receive loop.
//!
//! The built-in [`websocket`] module implements these for the WebSocket
//! appliance families; pub/sub families plug in their own connector.

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::{
    config::ClientConfig,
    error::Result,
    protocol::{Message, MessageKey},
};

pub mod websocket;

/// One receive-direction occurrence on a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A fragment of an application message. `is_final` marks the last
    /// fragment; a message delivered whole arrives as one final
    /// fragment.
    Frame {
        /// The fragment bytes.
        bytes: Bytes,
        /// Whether this fragment completes the message.
        is_final: bool,
    },

    /// A transport-level liveness probe to answer with
    /// [`TransportSink::pong`].
    Ping(Bytes),

    /// The peer closed the connection in an orderly fashion.
    Closed,
}

/// The write half of a connected transport.
#[async_trait]
pub trait TransportSink: Send {
    /// Writes one complete outgoing frame.
    async fn send(&mut self, frame: Bytes) -> Result<()>;

    /// Answers a liveness probe. Transports without control frames
    /// ignore this.
    async fn pong(&mut self, payload: Bytes) -> Result<()> {
        let _ = payload;
        Ok(())
    }

    /// Sends an application-level liveness probe. Transports without
    /// control frames ignore this.
    async fn ping(&mut self, payload: Bytes) -> Result<()> {
        let _ = payload;
        Ok(())
    }

    /// Closes the write half. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// The read half of a connected transport.
#[async_trait]
pub trait TransportStream: Send {
    /// Waits for the next receive-direction event.
    ///
    /// # Errors
    ///
    /// Will return `Err` of kind `ConnectionLost` when the transport
    /// fails; orderly closure is [`TransportEvent::Closed`], not an
    /// error.
    async fn next_event(&mut self) -> Result<TransportEvent>;
}

/// Vendor seam: connection establishment plus the frame codec.
///
/// `connect` performs the complete handshake for one session, including
/// any protocol-level subscribe step. Reconnects call it again, which
/// is what replays that step on a fresh session.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establishes one connection to the appliance at `address`.
    ///
    /// # Errors
    ///
    /// Will return `Err` of kind `HandshakeFailed` when the transport
    /// or protocol handshake does not complete; the reconnect
    /// supervisor treats that as retryable.
    async fn connect(
        &self,
        address: &Url,
        config: &ClientConfig,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)>;

    /// Encodes an outgoing request into a wire frame.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the payload cannot be represented on the
    /// wire.
    fn encode(&self, key: &MessageKey, payload: &[u8]) -> Result<Bytes>;

    /// Decodes one complete incoming frame into a message, extracting
    /// its correlation key.
    ///
    /// # Errors
    ///
    /// Will return `Err` of kind `ProtocolViolation` for malformed
    /// frames; the session drops the frame and keeps the connection.
    fn decode(&self, frame: Bytes) -> Result<Message>;
}
