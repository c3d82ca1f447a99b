//! Reconnect supervision.
//!
//! One supervisor task runs per connected client. It waits for the
//! active session to terminate; if the termination was not requested,
//! it retries connection establishment on a fixed-interval timer until
//! a new session comes up or the client is disposed. Individual attempt
//! failures are logged and swallowed; the supervisor never gives up on
//! its own.
//!
//! The task is owned by the client and joined on disposal, so no
//! orphaned reconnect work outlives the device client. A stop token
//! retires it when the caller disconnects deliberately.

use std::sync::Arc;

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    client::{ClientInner, ConnectionState},
    events::Event,
    session::Session,
};

/// Starts supervision of `session` for `inner`.
pub(crate) fn spawn(
    inner: Arc<ClientInner>,
    session: Arc<Session>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(supervise(inner, session, stop))
}

async fn supervise(inner: Arc<ClientInner>, mut session: Arc<Session>, stop: CancellationToken) {
    loop {
        let terminated = session.terminated();
        tokio::select! {
            () = inner.disposal.cancelled() => return,
            () = stop.cancelled() => return,
            () = terminated.cancelled() => {}
        }

        // Deliberate teardown is not connection loss.
        if session.was_user_closed() || inner.is_disposed() || stop.is_cancelled() {
            return;
        }

        warn!(
            "connection to {} lost; retrying every {:?}",
            inner.address, inner.config.reconnect_interval
        );
        inner.take_active();
        inner.set_state(ConnectionState::Reconnecting);
        inner.events.dispatch(&Event::Disconnected);
        inner.events.dispatch(&Event::Reconnecting);

        session = match reestablish(&inner, &stop).await {
            Some(session) => session,
            None => return,
        };
    }
}

/// Retries until a session comes up, the client is disposed, or the
/// supervisor is retired. The first attempt fires immediately, then one
/// per interval.
async fn reestablish(inner: &Arc<ClientInner>, stop: &CancellationToken) -> Option<Arc<Session>> {
    let mut timer = tokio::time::interval(inner.config.reconnect_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut unreachable_reported = false;

    loop {
        tokio::select! {
            () = inner.disposal.cancelled() => return None,
            () = stop.cancelled() => return None,
            _ = timer.tick() => {}
        }

        // A tick may race disposal; never open a session afterward.
        if inner.is_disposed() {
            return None;
        }

        match inner.open_session().await {
            Ok(session) => {
                if stop.is_cancelled() {
                    session.close(true).await;
                    return None;
                }

                // Installation refuses when disposal raced the attempt;
                // the supervisor closes what it opened and stands down.
                if let Err(refused) = inner.install_active(Arc::clone(&session)) {
                    refused.close(true).await;
                    return None;
                }
                inner.set_state(ConnectionState::Connected);
                info!("reconnected to {}", inner.address);
                inner.events.dispatch(&Event::Connected);
                return Some(session);
            }
            Err(e) => {
                // Swallowed: the next tick tries again.
                debug!("reconnect attempt failed: {e}");
                if !unreachable_reported {
                    inner.events.dispatch(&Event::Unreachable);
                    unreachable_reported = true;
                }
            }
        }
    }
}
