//! Device client facade.
//!
//! A [`DeviceClient`] is the public surface a vendor driver uses to
//! talk to one physical appliance. It owns the currently active
//! [`Session`] and swaps it atomically across reconnects, so concurrent
//! callers always observe either the old or the new session, never a
//! half-torn-down one. Drivers connect once; after that, unexpected
//! connection loss is handled by the background reconnect supervisor
//! until the client is disposed.
//!
//! One client is created per appliance and typically lives for the
//! process.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::ClientConfig,
    error::{Error, Result},
    events::{Event, EventDispatcher, EventKind, SubscriptionHandle},
    pool::BufferPool,
    protocol::{Message, MessageKey},
    reconnect,
    session::Session,
    transport::Connector,
};

/// Connection state of a [`DeviceClient`].
///
/// Exactly one state holds at any time; transitions are serialized.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No session and no background activity.
    Disconnected,

    /// A first connection attempt is in progress.
    Connecting,

    /// A session is established.
    Connected,

    /// The session died unexpectedly; the supervisor is retrying.
    Reconnecting,

    /// An explicit disconnect is tearing the session down.
    Disconnecting,

    /// Terminal. Reachable from every other state.
    Disposed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnecting => "disconnecting",
            Self::Disposed => "disposed",
        };
        write!(f, "{state}")
    }
}

/// The public-facing client for one physical appliance.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone, Debug)]
pub struct DeviceClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) address: Url,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) events: Arc<EventDispatcher>,
    pool: Arc<BufferPool>,

    state: Mutex<ConnectionState>,
    active: Mutex<Option<Arc<Session>>>,

    disposed: AtomicBool,
    pub(crate) disposal: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    supervisor_stop: Mutex<Option<CancellationToken>>,
}

impl DeviceClient {
    /// Returns a new, unconnected client for the appliance at
    /// `address`.
    #[must_use]
    pub fn new(address: Url, connector: Arc<dyn Connector>, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                address,
                connector,
                events: Arc::new(EventDispatcher::new()),
                pool: Arc::new(BufferPool::default()),
                state: Mutex::new(ConnectionState::Disconnected),
                active: Mutex::new(None),
                disposed: AtomicBool::new(false),
                disposal: CancellationToken::new(),
                supervisor: Mutex::new(None),
                supervisor_stop: Mutex::new(None),
            }),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Performs the first connection.
    ///
    /// Does not retry: whether an absent appliance is fatal is the
    /// caller's decision. Once connected, unexpected loss is handled by
    /// the reconnect supervisor.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the client is disposed, already connected,
    /// or the handshake fails.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_live()?;
        {
            let mut state = self.inner.state.lock()?;
            match *state {
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
                other => {
                    return Err(Error::invalid_argument(format!(
                        "cannot connect while {other}"
                    )))
                }
            }
        }

        match self.inner.open_session().await {
            Ok(session) => {
                // Disposal may have raced the handshake; installation
                // refuses under the same lock `dispose` drains, so the
                // session is either taken over or closed here.
                if let Err(refused) = self.inner.install_active(Arc::clone(&session)) {
                    refused.close(true).await;
                    return Err(Error::disposed("client disposed during connect"));
                }
                self.inner.set_state(ConnectionState::Connected);

                let stop = CancellationToken::new();
                let handle = reconnect::spawn(Arc::clone(&self.inner), session, stop.clone());
                if let Ok(mut supervisor_stop) = self.inner.supervisor_stop.lock() {
                    *supervisor_stop = Some(stop);
                }
                if let Ok(mut supervisor) = self.inner.supervisor.lock() {
                    *supervisor = Some(handle);
                }

                self.inner.events.dispatch(&Event::Connected);
                Ok(())
            }
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Sends a message without waiting for a reply.
    ///
    /// # Errors
    ///
    /// Will return `Err` of kind `ConnectionLost` when no session is
    /// active; the message is not queued.
    pub async fn send(&self, key: &MessageKey, payload: &[u8]) -> Result<()> {
        self.ensure_live()?;
        let session = self.require_session()?;
        let frame = self.inner.connector.encode(key, payload)?;
        session.send(frame).await
    }

    /// Sends a request and awaits the correlated reply.
    ///
    /// Concurrent requests for the same key share one network exchange
    /// and all receive the same reply. `timeout` falls back to the
    /// configured request timeout when `None`.
    ///
    /// # Errors
    ///
    /// Will return `Err` of kind:
    /// - `ConnectionLost` if no session is active, or the session dies
    ///   before the reply arrives
    /// - `Timeout` if the deadline elapses first; other pending
    ///   requests are unaffected
    pub async fn request(
        &self,
        key: &MessageKey,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Message> {
        self.ensure_live()?;
        let session = self.require_session()?;

        // The ticket withdraws its waiter on drop, so every early
        // return below leaves the table clean.
        let mut ticket = session.table().register(key);
        if ticket.first {
            let frame = self.inner.connector.encode(key, payload)?;
            session.send(frame).await?;
        } else {
            trace!("joining in-flight request for `{key}`");
        }

        let deadline = timeout.unwrap_or(self.inner.config.request_timeout);
        match tokio::time::timeout(deadline, &mut ticket.reply).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(Error::connection_lost(format!(
                "session closed while `{key}` was pending"
            ))),
            Err(_) => Err(Error::timeout(format!(
                "no reply for `{key}` within {deadline:?}"
            ))),
        }
    }

    /// Subscribes a listener to events of `kind`.
    ///
    /// Subscriptions live on the client, not the session: they survive
    /// reconnects until unsubscribed or the client is disposed.
    ///
    /// # Errors
    ///
    /// Will return `Err` of kind `Disposed` after disposal.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.ensure_live()?;
        Ok(self.inner.events.subscribe(kind, listener))
    }

    /// Closes the active session without disposing the client.
    ///
    /// The supervisor does not treat this as connection loss; a later
    /// [`connect`](Self::connect) establishes a fresh session.
    ///
    /// # Errors
    ///
    /// Will return `Err` of kind `Disposed` after disposal.
    pub async fn disconnect(&self) -> Result<()> {
        self.ensure_live()?;

        // Retire the supervisor first so the session teardown below is
        // not mistaken for unexpected loss.
        self.inner.retire_supervisor_token();
        self.inner.set_state(ConnectionState::Disconnecting);

        if let Some(session) = self.inner.take_active() {
            session.close(true).await;
        }
        self.inner.join_supervisor().await;

        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.events.dispatch(&Event::Disconnected);
        Ok(())
    }

    /// Disposes the client: stops the reconnect supervisor, closes the
    /// active session, cancels all pending requests and removes all
    /// subscriptions.
    ///
    /// Terminal and idempotent; concurrent calls are safe.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("disposing device client for {}", self.inner.address);
        self.inner.set_state(ConnectionState::Disposed);
        self.inner.disposal.cancel();
        self.inner.retire_supervisor_token();

        if let Some(session) = self.inner.take_active() {
            session.close(true).await;
        }
        self.inner.join_supervisor().await;
        self.inner.events.clear();
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.is_disposed() {
            return Err(Error::disposed("device client has been disposed"));
        }
        Ok(())
    }

    fn require_session(&self) -> Result<Arc<Session>> {
        self.inner.active().ok_or_else(|| {
            Error::connection_lost(format!("not connected ({})", self.inner.state()))
        })
    }
}

impl ClientInner {
    pub(crate) fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map_or(ConnectionState::Disposed, |state| *state)
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            // Disposed is terminal; no transition leaves it.
            if *state == ConnectionState::Disposed {
                return;
            }
            trace!("connection state {} -> {next}", *state);
            *state = next;
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn active(&self) -> Option<Arc<Session>> {
        self.active.lock().map_or(None, |active| active.clone())
    }

    /// Installs `session` as the active session in one pointer
    /// exchange.
    ///
    /// The disposed check happens under the same lock, so a session
    /// whose handshake raced `dispose` is refused and handed back for
    /// closing rather than installed on a disposed client.
    pub(crate) fn install_active(
        &self,
        session: Arc<Session>,
    ) -> std::result::Result<(), Arc<Session>> {
        let Ok(mut active) = self.active.lock() else {
            return Err(session);
        };
        if self.is_disposed() {
            return Err(session);
        }
        *active = Some(session);
        Ok(())
    }

    /// Removes and returns the active session in one pointer exchange.
    pub(crate) fn take_active(&self) -> Option<Arc<Session>> {
        self.active.lock().map_or(None, |mut active| active.take())
    }

    pub(crate) async fn open_session(&self) -> Result<Arc<Session>> {
        Session::open(
            &self.connector,
            &self.address,
            &self.config,
            &self.pool,
            &self.events,
        )
        .await
    }

    fn retire_supervisor_token(&self) {
        let stop = self
            .supervisor_stop
            .lock()
            .ok()
            .and_then(|mut stop| stop.take());
        if let Some(stop) = stop {
            stop.cancel();
        }
    }

    async fn join_supervisor(&self) {
        let handle = self
            .supervisor
            .lock()
            .ok()
            .and_then(|mut supervisor| supervisor.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("reconnect supervisor did not stop cleanly: {e}");
            }
        }
    }
}

impl fmt::Debug for ClientInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientInner")
            .field("address", &self.address.as_str())
            .field("state", &self.state())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
