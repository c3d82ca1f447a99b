//! Connection sessions.
//!
//! A [`Session`] represents exactly one successful connection to an
//! appliance: the transport's write half behind a lock, one background
//! receive task, and the correlation table scoped to its lifetime. It
//! is created by a completed handshake and destroyed on close or
//! disposal; the device client creates and discards many sessions over
//! its life.
//!
//! The receive task reads transport events, reassembles fragments into
//! complete messages, and dispatches each message: a message matching a
//! pending request resolves it, anything else is routed to push-event
//! subscribers. Malformed messages are dropped without tearing the
//! session down. On teardown, every pending request is failed with
//! `ConnectionLost`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use bytes::Bytes;
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::ClientConfig,
    correlate::CorrelationTable,
    error::{Error, Result},
    events::{Event, EventDispatcher},
    pool::BufferPool,
    reassembly::Reassembler,
    transport::{Connector, TransportEvent, TransportSink, TransportStream},
};

/// One live connection to an appliance.
pub struct Session {
    sink: Arc<AsyncMutex<Box<dyn TransportSink>>>,
    table: Arc<CorrelationTable>,

    /// Requests the receive loop to stop.
    shutdown: CancellationToken,

    /// Cancelled by the receive loop once it has fully stopped, for
    /// whatever reason. The reconnect supervisor watches this.
    terminated: CancellationToken,

    user_closed: AtomicBool,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Performs the handshake and starts the receive loop.
    ///
    /// The connect timeout from `config` covers the whole attempt.
    ///
    /// # Errors
    ///
    /// Will return `Err` of kind `HandshakeFailed` when the handshake
    /// does not complete in time, so the reconnect supervisor can retry
    /// uniformly.
    pub async fn open(
        connector: &Arc<dyn Connector>,
        address: &Url,
        config: &ClientConfig,
        pool: &Arc<BufferPool>,
        events: &Arc<EventDispatcher>,
    ) -> Result<Arc<Self>> {
        let (sink, stream) =
            tokio::time::timeout(config.connect_timeout, connector.connect(address, config))
                .await
                .map_err(|_| {
                    Error::handshake_failed(format!(
                        "connection attempt timed out after {:?}",
                        config.connect_timeout
                    ))
                })??;

        let session = Arc::new(Self {
            sink: Arc::new(AsyncMutex::new(sink)),
            table: Arc::new(CorrelationTable::new()),
            shutdown: CancellationToken::new(),
            terminated: CancellationToken::new(),
            user_closed: AtomicBool::new(false),
            receiver: Mutex::new(None),
        });

        let receive_loop = ReceiveLoop {
            stream,
            sink: Arc::clone(&session.sink),
            connector: Arc::clone(connector),
            table: Arc::clone(&session.table),
            events: Arc::clone(events),
            reassembler: Reassembler::new(Arc::clone(pool)),
            shutdown: session.shutdown.clone(),
            terminated: session.terminated.clone(),
            ping_interval: config.ping_interval,
        };
        let handle = tokio::spawn(receive_loop.run());
        if let Ok(mut receiver) = session.receiver.lock() {
            *receiver = Some(handle);
        }

        Ok(session)
    }

    /// Writes one frame to the transport.
    ///
    /// Safe to call concurrently; concurrent sends are serialized so
    /// frames never interleave.
    ///
    /// # Errors
    ///
    /// Will return `Err` of kind `ConnectionLost` if the session is
    /// closed or closing.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        if self.shutdown.is_cancelled() || self.terminated.is_cancelled() {
            return Err(Error::connection_lost("session is closed"));
        }

        let mut sink = self.sink.lock().await;
        sink.send(frame).await
    }

    /// The correlation table scoped to this session.
    #[must_use]
    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    /// A token cancelled once the receive loop has fully stopped.
    #[must_use]
    pub fn terminated(&self) -> CancellationToken {
        self.terminated.clone()
    }

    /// Whether this session was closed by explicit request rather than
    /// dying unexpectedly. Decides whether the supervisor reconnects.
    #[must_use]
    pub fn was_user_closed(&self) -> bool {
        self.user_closed.load(Ordering::SeqCst)
    }

    /// Stops the receive loop, closes the transport and cancels all
    /// pending requests.
    ///
    /// Idempotent; safe to call more than once or concurrently.
    pub async fn close(&self, user_initiated: bool) {
        if user_initiated {
            self.user_closed.store(true, Ordering::SeqCst);
        }
        self.shutdown.cancel();

        {
            let mut sink = self.sink.lock().await;
            let _ = sink.close().await;
        }

        let receiver = self
            .receiver
            .lock()
            .ok()
            .and_then(|mut receiver| receiver.take());
        if let Some(handle) = receiver {
            if let Err(e) = handle.await {
                error!("receive loop did not stop cleanly: {e}");
            }
        }

        // The receive loop normally performs these on exit; repeat here
        // for the case where it was already gone.
        self.table.cancel_all();
        self.terminated.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pending", &self.table.len())
            .field("closing", &self.shutdown.is_cancelled())
            .field("terminated", &self.terminated.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Placeholder period when keep-alive pings are disabled; the guard on
/// the select arm keeps the timer from ever firing a ping.
const KEEPALIVE_DISABLED: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

struct ReceiveLoop {
    stream: Box<dyn TransportStream>,
    sink: Arc<AsyncMutex<Box<dyn TransportSink>>>,
    connector: Arc<dyn Connector>,
    table: Arc<CorrelationTable>,
    events: Arc<EventDispatcher>,
    reassembler: Reassembler,
    shutdown: CancellationToken,
    terminated: CancellationToken,
    ping_interval: Option<std::time::Duration>,
}

impl ReceiveLoop {
    async fn run(mut self) {
        let keepalive = self.ping_interval.unwrap_or(KEEPALIVE_DISABLED);
        let mut keepalive_timer = tokio::time::interval(keepalive);
        keepalive_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately; consume
        // it so the first ping goes out one period after connecting.
        keepalive_timer.tick().await;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    debug!("receive loop stopped");
                    break;
                }

                _ = keepalive_timer.tick(), if self.ping_interval.is_some() => {
                    trace!("sending keep-alive ping");
                    let mut sink = self.sink.lock().await;
                    if let Err(e) = sink.ping(Bytes::new()).await {
                        error!("error sending keep-alive ping: {e}");
                    }
                }

                event = self.stream.next_event() => match event {
                    Ok(TransportEvent::Frame { bytes, is_final }) => {
                        if let Some(frame) = self.reassembler.push(bytes, is_final) {
                            self.dispatch(frame);
                        }
                    }
                    Ok(TransportEvent::Ping(payload)) => {
                        trace!("ping -> pong");
                        let mut sink = self.sink.lock().await;
                        if let Err(e) = sink.pong(payload).await {
                            error!("error sending pong: {e}");
                        }
                    }
                    Ok(TransportEvent::Closed) => {
                        if self.reassembler.is_accumulating() {
                            warn!("connection closed mid-message; discarding partial message");
                        }
                        info!("connection closed by appliance");
                        break;
                    }
                    Err(e) => {
                        error!("transport error: {e}");
                        break;
                    }
                }
            }
        }

        // Teardown order matters: release the partial buffer, then fail
        // the pending requests, then signal termination so the
        // supervisor observes a fully settled session.
        self.reassembler.abort();
        self.table.cancel_all();
        self.terminated.cancel();
    }

    /// Routes one complete message: a pending request on its key wins;
    /// otherwise it is an unsolicited push event. Malformed frames are
    /// logged and dropped without affecting the session.
    fn dispatch(&self, frame: Bytes) {
        match self.connector.decode(frame) {
            Ok(message) => {
                if !self.table.resolve(&message) {
                    self.events.dispatch(&Event::Push(message));
                }
            }
            Err(e) => warn!("dropping malformed message: {e}"),
        }
    }
}
