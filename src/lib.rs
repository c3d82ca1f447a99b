//! Resilient streaming device-protocol client for smart-home
//! appliances.
//!
//! Home-automation hubs talk to TVs, media servers and similar
//! appliances over long-lived connections that fragment messages,
//! answer requests with push-style replies on the same channel, and
//! drop without warning. This crate is the client core shared by those
//! integrations: it keeps one connection per appliance alive,
//! reassembles complete messages out of transport fragments, correlates
//! replies with in-flight requests, routes unsolicited notifications to
//! subscribers, and reconnects transparently after failure without
//! losing observers.
//!
//! The public surface is the [`DeviceClient`](client::DeviceClient):
//! connect, send, request/reply, subscribe, dispose. Vendor drivers
//! supply the protocol specifics through the
//! [`Connector`](transport::Connector) seam; a WebSocket implementation
//! with a JSON envelope codec is built in.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use homelink::{
//!     client::DeviceClient,
//!     config::ClientConfig,
//!     transport::websocket::WebSocketConnector,
//! };
//!
//! #[tokio::main]
//! async fn main() -> homelink::error::Result<()> {
//!     let address: url::Url = "ws://tv.local:3000/api".parse()?;
//!     let client = DeviceClient::new(
//!         address,
//!         Arc::new(WebSocketConnector::new()),
//!         ClientConfig::with_device_name("living-room-hub"),
//!     );
//!
//!     client.connect().await?;
//!     let volume = client
//!         .request(&"audio/getVolume".parse()?, b"", None)
//!         .await?;
//!     println!("volume: {:?}", volume.decode::<u32>()?);
//!
//!     client.dispose().await;
//!     Ok(())
//! }
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod client;
pub mod config;
pub mod correlate;
pub mod error;
pub mod events;
pub mod pool;
pub mod protocol;
pub mod reassembly;
pub mod session;
pub mod transport;

mod reconnect;

pub use client::{ConnectionState, DeviceClient};
pub use config::ClientConfig;
pub use error::{Error, ErrorKind, Result};
pub use events::{Event, EventKind, SubscriptionHandle};
pub use protocol::{Message, MessageKey};
