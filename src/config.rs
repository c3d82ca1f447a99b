//! Client configuration.
//!
//! [`ClientConfig`] carries the identity a device client presents to an
//! appliance and the timing knobs for connection establishment, request
//! deadlines and reconnection. All timing values are tunables, not
//! protocol requirements.

use std::time::Duration;

use uuid::Uuid;

/// Configuration for a [`DeviceClient`](crate::client::DeviceClient).
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ClientConfig {
    /// Name this client presents to the appliance, e.g. in protocol
    /// handshakes that carry a friendly name.
    pub device_name: String,

    /// Stable identity of this client instance.
    pub device_id: Uuid,

    /// Deadline for one connection attempt, covering the transport
    /// connect and the protocol handshake.
    pub connect_timeout: Duration,

    /// Default deadline for [`request`](crate::client::DeviceClient::request)
    /// when the caller does not pass one.
    pub request_timeout: Duration,

    /// Interval between reconnection attempts after unexpected
    /// connection loss.
    pub reconnect_interval: Duration,

    /// Interval for application-level keep-alive pings, if any.
    ///
    /// Some appliances force-disconnect clients that enable
    /// transport-level keep-alive, so liveness detection relies on
    /// request traffic or these pings instead. `None` (the default)
    /// sends no pings.
    pub ping_interval: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            device_name: env!("CARGO_PKG_NAME").to_owned(),
            device_id: Uuid::new_v4(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(10),
            ping_interval: None,
        }
    }
}

impl ClientConfig {
    /// Returns a configuration with the given device name and fresh
    /// device id, and default timing values.
    #[must_use]
    pub fn with_device_name(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            ..Self::default()
        }
    }
}
