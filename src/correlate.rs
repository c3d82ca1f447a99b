//! Request/reply correlation.
//!
//! The appliance protocols carry no true correlation identifiers: a
//! reply is simply the next message on the key its request went out on.
//! The [`CorrelationTable`] makes that safe by enforcing single-flight
//! per key: at most one exchange is in flight per key, and concurrent
//! callers for the same key share it, each receiving a clone of the one
//! reply.
//!
//! Every pending request is scoped to one session. On session teardown
//! [`cancel_all`](CorrelationTable::cancel_all) fails every outstanding
//! waiter with `ConnectionLost` so no caller hangs across a reconnect;
//! a [`Ticket`] dropped before resolution withdraws its own waiter, so
//! a cancelled caller never leaves a stale exchange behind.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Instant,
};

use tokio::sync::oneshot;

use crate::{
    error::{Error, Result},
    protocol::{Message, MessageKey},
};

/// A claim on the in-flight exchange for one key.
///
/// The ticket withdraws its waiter from the table on drop, so timeout,
/// error and caller-cancellation paths all clean up uniformly; other
/// waiters on the same key are unaffected. A ticket dropped after its
/// exchange resolved finds nothing left to withdraw.
#[derive(Debug)]
pub struct Ticket {
    /// Identifies this waiter within its entry.
    pub id: u64,

    /// Resolves with the reply, or with `ConnectionLost` on teardown.
    pub reply: oneshot::Receiver<Result<Message>>,

    /// Whether this ticket opened the exchange. Exactly one ticket per
    /// exchange is first; only that caller performs the network send.
    pub first: bool,

    key: MessageKey,
    table: Weak<CorrelationTable>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.abandon(&self.key, self.id);
        }
    }
}

#[derive(Debug)]
struct Pending {
    waiters: Vec<(u64, oneshot::Sender<Result<Message>>)>,
    created_at: Instant,
}

/// Maps outstanding requests to the future messages that answer them.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<MessageKey, Pending>>,
    next_waiter: AtomicU64,
}

impl CorrelationTable {
    /// Returns a new, empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in the reply for `key`.
    ///
    /// If no exchange is in flight for `key`, one is opened and the
    /// returned ticket is marked `first`. Otherwise the ticket joins the
    /// existing exchange, collapsing concurrent identical requests into
    /// one network round trip.
    pub fn register(self: &Arc<Self>, key: &MessageKey) -> Ticket {
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        let first = !pending.contains_key(key);
        pending
            .entry(key.clone())
            .or_insert_with(|| Pending {
                waiters: Vec::new(),
                created_at: Instant::now(),
            })
            .waiters
            .push((id, tx));

        Ticket {
            id,
            reply: rx,
            first,
            key: key.clone(),
            table: Arc::downgrade(self),
        }
    }

    /// Resolves the exchange for `message.key`, completing every waiter
    /// with a clone of the message.
    ///
    /// Returns whether an exchange was pending on that key, so the
    /// caller can route unmatched messages as unsolicited events
    /// instead.
    pub fn resolve(&self, message: &Message) -> bool {
        let entry = {
            let mut pending = match self.pending.lock() {
                Ok(pending) => pending,
                Err(poisoned) => poisoned.into_inner(),
            };
            pending.remove(&message.key)
        };

        let Some(entry) = entry else {
            return false;
        };

        trace!(
            "resolving `{}` after {:?} for {} waiter(s)",
            message.key,
            entry.created_at.elapsed(),
            entry.waiters.len()
        );
        for (_, waiter) in entry.waiters {
            // A waiter that timed out or cancelled has dropped its
            // receiver; that is not an error.
            let _ = waiter.send(Ok(message.clone()));
        }
        true
    }

    /// Withdraws one waiter from the exchange for `key`.
    ///
    /// Invoked by [`Ticket`] on drop when a caller times out, errors
    /// out or cancels; other waiters on the same key are unaffected.
    /// The exchange itself is closed when its last waiter withdraws.
    pub fn abandon(&self, key: &MessageKey, id: u64) {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = pending.get_mut(key) {
            entry.waiters.retain(|(waiter, _)| *waiter != id);
            if entry.waiters.is_empty() {
                pending.remove(key);
            }
        }
    }

    /// Fails every outstanding waiter with `ConnectionLost` and clears
    /// the table.
    ///
    /// Invoked by the session on teardown; no pending request may
    /// outlive its session.
    pub fn cancel_all(&self) {
        let entries: Vec<_> = {
            let mut pending = match self.pending.lock() {
                Ok(pending) => pending,
                Err(poisoned) => poisoned.into_inner(),
            };
            pending.drain().collect()
        };

        if entries.is_empty() {
            return;
        }

        debug!("cancelling {} pending request(s)", entries.len());
        for (key, entry) in entries {
            for (_, waiter) in entry.waiters {
                let _ = waiter.send(Err(Error::connection_lost(format!(
                    "session closed while `{key}` was pending"
                ))));
            }
        }
    }

    /// Number of keys with an exchange in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().map_or(0, |pending| pending.len())
    }

    /// Whether no exchange is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
