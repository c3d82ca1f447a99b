//! Events emitted by a device client.
//!
//! Drivers subscribe to connection lifecycle events and to unsolicited
//! push notifications from the appliance. Dispatch takes a snapshot of
//! the listener list before invoking it, so a listener that
//! unsubscribes (or subscribes) during dispatch never corrupts the
//! iteration; it only takes effect from the next event on.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use crate::protocol::Message;

/// Events that can be emitted by a device client.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A session to the appliance is established. Also fires after a
    /// successful reconnect.
    Connected,

    /// The session ended, either by request or unexpectedly.
    Disconnected,

    /// The session died unexpectedly and the client is retrying in the
    /// background.
    Reconnecting,

    /// A reconnect attempt failed; the appliance is asleep or
    /// unreachable. Fires once per outage, not per attempt.
    Unreachable,

    /// An unsolicited push notification from the appliance, e.g. a
    /// volume or state change.
    Push(Message),
}

impl Event {
    /// Returns the kind used to route this event to subscribers.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::Reconnecting => EventKind::Reconnecting,
            Self::Unreachable => EventKind::Unreachable,
            Self::Push(_) => EventKind::Push,
        }
    }
}

/// Subscription categories for [`Event`]s.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// See [`Event::Connected`].
    Connected,
    /// See [`Event::Disconnected`].
    Disconnected,
    /// See [`Event::Reconnecting`].
    Reconnecting,
    /// See [`Event::Unreachable`].
    Unreachable,
    /// See [`Event::Push`].
    Push,
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Routes events to subscribed listeners.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: Mutex<HashMap<EventKind, Vec<(u64, Listener)>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    /// Returns a new dispatcher with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener for `kind`, returning a handle that removes it.
    pub fn subscribe<F>(self: &Arc<Self>, kind: EventKind, listener: F) -> SubscriptionHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners
                .entry(kind)
                .or_default()
                .push((id, Arc::new(listener)));
        }

        SubscriptionHandle {
            kind,
            id,
            dispatcher: Arc::downgrade(self),
        }
    }

    /// Dispatches `event` to the listeners subscribed to its kind, in
    /// subscription order.
    pub fn dispatch(&self, event: &Event) {
        // Snapshot under the lock, invoke outside it: listeners may
        // themselves subscribe or unsubscribe.
        let snapshot: Vec<Listener> = self.listeners.lock().map_or_else(
            |_| Vec::new(),
            |listeners| {
                listeners
                    .get(&event.kind())
                    .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
                    .unwrap_or_default()
            },
        );

        for listener in snapshot {
            listener(event);
        }
    }

    /// Removes every listener. Called on disposal.
    pub fn clear(&self) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.clear();
        }
    }

    fn unsubscribe(&self, kind: EventKind, id: u64) {
        if let Ok(mut listeners) = self.listeners.lock() {
            if let Some(entries) = listeners.get_mut(&kind) {
                entries.retain(|(entry_id, _)| *entry_id != id);
                if entries.is_empty() {
                    listeners.remove(&kind);
                }
            }
        }
    }

    #[cfg(test)]
    fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .lock()
            .map_or(0, |listeners| listeners.get(&kind).map_or(0, Vec::len))
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher").finish_non_exhaustive()
    }
}

/// Removes a listener when asked to.
///
/// The handle does not unsubscribe on drop; a listener stays registered
/// until [`unsubscribe`](Self::unsubscribe) is called or the client is
/// disposed.
#[derive(Debug)]
pub struct SubscriptionHandle {
    kind: EventKind,
    id: u64,
    dispatcher: Weak<EventDispatcher>,
}

impl SubscriptionHandle {
    /// Removes the listener this handle refers to.
    pub fn unsubscribe(self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.unsubscribe(self.kind, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn dispatches_in_subscription_order() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let order = Arc::clone(&order);
            let _ = dispatcher.subscribe(EventKind::Connected, move |_| {
                order.lock().unwrap().push(tag);
            });
        }

        dispatcher.dispatch(&Event::Connected);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn unsubscribe_removes_listener() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handle = {
            let calls = Arc::clone(&calls);
            dispatcher.subscribe(EventKind::Disconnected, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        dispatcher.dispatch(&Event::Disconnected);
        handle.unsubscribe();
        dispatcher.dispatch(&Event::Disconnected);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_unsubscribe_itself_during_dispatch() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handle_slot: Arc<Mutex<Option<SubscriptionHandle>>> =
            Arc::new(Mutex::new(None));
        let handle = {
            let calls = Arc::clone(&calls);
            let handle_slot = Arc::clone(&handle_slot);
            dispatcher.subscribe(EventKind::Connected, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(handle) = handle_slot.lock().unwrap().take() {
                    handle.unsubscribe();
                }
            })
        };
        *handle_slot.lock().unwrap() = Some(handle);

        // Self-unsubscription takes effect for the next dispatch, and
        // does not disturb this one.
        dispatcher.dispatch(&Event::Connected);
        dispatcher.dispatch(&Event::Connected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.listener_count(EventKind::Connected), 0);
    }

    #[test]
    fn clear_removes_everything() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let _ = dispatcher.subscribe(EventKind::Push, |_| {});
        let _ = dispatcher.subscribe(EventKind::Connected, |_| {});

        dispatcher.clear();
        assert_eq!(dispatcher.listener_count(EventKind::Push), 0);
        assert_eq!(dispatcher.listener_count(EventKind::Connected), 0);
    }
}
