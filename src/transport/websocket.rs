//! WebSocket transport.
//!
//! Implements the transport seam over `tokio-tungstenite` with the
//! default JSON [`Envelope`] codec. This is the transport the
//! WebSocket notification clients (TVs and the like) run on; the
//! connected stream is split into its sink and stream halves so sends
//! and the receive loop proceed independently.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio_tungstenite::{
    tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use super::{Connector, TransportEvent, TransportSink, TransportStream};
use crate::{
    config::ClientConfig,
    error::{Error, Result},
    protocol::{Envelope, Message, MessageKey},
};

type WsStreamInner = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connects to an appliance over WebSocket, speaking the JSON envelope
/// protocol.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Returns a new connector.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        address: &Url,
        config: &ClientConfig,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)> {
        debug!(
            "connecting to {address} as `{}` ({})",
            config.device_name, config.device_id
        );
        let (ws_stream, response) = tokio_tungstenite::connect_async(address.as_str())
            .await
            .map_err(Error::handshake_failed)?;
        trace!("websocket handshake response: {}", response.status());

        let (tx, rx) = ws_stream.split();
        Ok((Box::new(WsSink { tx }), Box::new(WsStream { rx })))
    }

    fn encode(&self, key: &MessageKey, payload: &[u8]) -> Result<Bytes> {
        let payload = if payload.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(payload)?
        };
        Envelope::request(key.clone(), payload).to_frame()
    }

    fn decode(&self, frame: Bytes) -> Result<Message> {
        Envelope::from_frame(&frame)?.into_message()
    }
}

struct WsSink {
    tx: SplitSink<WsStreamInner, WsMessage>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.tx
            .send(WsMessage::Binary(frame))
            .await
            .map_err(Into::into)
    }

    async fn pong(&mut self, payload: Bytes) -> Result<()> {
        self.tx
            .send(WsMessage::Pong(payload))
            .await
            .map_err(Into::into)
    }

    async fn ping(&mut self, payload: Bytes) -> Result<()> {
        self.tx
            .send(WsMessage::Ping(payload))
            .await
            .map_err(Into::into)
    }

    async fn close(&mut self) -> Result<()> {
        // Closing an already closed sink is not a failure.
        let _ = self.tx.close().await;
        Ok(())
    }
}

struct WsStream {
    rx: SplitStream<WsStreamInner>,
}

#[async_trait]
impl TransportStream for WsStream {
    async fn next_event(&mut self) -> Result<TransportEvent> {
        loop {
            let Some(message) = self.rx.next().await else {
                return Ok(TransportEvent::Closed);
            };

            match message? {
                // Tungstenite reassembles websocket fragments itself,
                // so every message surfaces as one final frame.
                WsMessage::Text(text) => {
                    return Ok(TransportEvent::Frame {
                        bytes: Bytes::from(text),
                        is_final: true,
                    })
                }
                WsMessage::Binary(bytes) => {
                    return Ok(TransportEvent::Frame {
                        bytes,
                        is_final: true,
                    })
                }
                WsMessage::Ping(payload) => return Ok(TransportEvent::Ping(payload)),
                WsMessage::Close(frame) => {
                    debug!("connection closed by appliance: {frame:?}");
                    return Ok(TransportEvent::Closed);
                }
                // Pongs acknowledge our keep-alive pings; raw frames do
                // not surface with the default configuration.
                WsMessage::Pong(_) | WsMessage::Frame(_) => {}
            }
        }
    }
}
