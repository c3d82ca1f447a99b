//! End-to-end tests for the device client against a scripted in-memory
//! transport.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use url::Url;

use homelink::{
    client::{ConnectionState, DeviceClient},
    config::ClientConfig,
    error::{Error, ErrorKind, Result},
    events::{Event, EventKind},
    protocol::{Message, MessageKey},
    transport::{Connector, TransportEvent, TransportSink, TransportStream},
};

/// Test-side handle on one established mock connection.
struct Link {
    /// Injects receive-direction events into the client.
    incoming: mpsc::UnboundedSender<TransportEvent>,
    /// Observes frames the client writes.
    outgoing: mpsc::UnboundedReceiver<Bytes>,
}

/// A connector whose frames are `key '\n' payload`, handing the test a
/// [`Link`] per successful connection. `fail_next` counts connection
/// attempts to reject; `usize::MAX` means reject forever.
struct MockConnector {
    fail_next: Arc<AtomicUsize>,
    links: mpsc::UnboundedSender<Link>,
    sends: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _address: &Url,
        _config: &ClientConfig,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(Error::handshake_failed("device not reachable"));
        }

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let _ = self.links.send(Link {
            incoming: in_tx,
            outgoing: out_rx,
        });

        Ok((
            Box::new(MockSink {
                outgoing: out_tx,
                sends: Arc::clone(&self.sends),
                pings: Arc::clone(&self.pings),
            }),
            Box::new(MockStream { incoming: in_rx }),
        ))
    }

    fn encode(&self, key: &MessageKey, payload: &[u8]) -> Result<Bytes> {
        let mut frame = key.as_str().as_bytes().to_vec();
        frame.push(b'\n');
        frame.extend_from_slice(payload);
        Ok(Bytes::from(frame))
    }

    fn decode(&self, frame: Bytes) -> Result<Message> {
        let split = frame
            .iter()
            .position(|&byte| byte == b'\n')
            .ok_or_else(|| Error::protocol_violation("frame has no key separator"))?;
        let key = std::str::from_utf8(&frame[..split])
            .map_err(Error::protocol_violation)?
            .parse()?;
        Ok(Message::new(key, frame.slice(split + 1..)))
    }
}

struct MockSink {
    outgoing: mpsc::UnboundedSender<Bytes>,
    sends: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
}

#[async_trait]
impl TransportSink for MockSink {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.outgoing
            .send(frame)
            .map_err(|_| Error::connection_lost("mock link dropped"))
    }

    async fn ping(&mut self, _payload: Bytes) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MockStream {
    incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl TransportStream for MockStream {
    async fn next_event(&mut self) -> Result<TransportEvent> {
        match self.incoming.recv().await {
            Some(event) => Ok(event),
            None => Ok(TransportEvent::Closed),
        }
    }
}

struct Harness {
    client: DeviceClient,
    links: mpsc::UnboundedReceiver<Link>,
    fail_next: Arc<AtomicUsize>,
    sends: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
}

fn harness(fail_next: usize, configure: impl FnOnce(&mut ClientConfig)) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let (links_tx, links_rx) = mpsc::unbounded_channel();
    let fail_next = Arc::new(AtomicUsize::new(fail_next));
    let sends = Arc::new(AtomicUsize::new(0));
    let pings = Arc::new(AtomicUsize::new(0));
    let connector = MockConnector {
        fail_next: Arc::clone(&fail_next),
        links: links_tx,
        sends: Arc::clone(&sends),
        pings: Arc::clone(&pings),
    };

    let mut config = ClientConfig::with_device_name("test-hub");
    config.connect_timeout = Duration::from_secs(1);
    config.request_timeout = Duration::from_secs(1);
    config.reconnect_interval = Duration::from_millis(25);
    configure(&mut config);

    let address: Url = "mock://appliance.local".parse().unwrap();
    Harness {
        client: DeviceClient::new(address, Arc::new(connector), config),
        links: links_rx,
        fail_next,
        sends,
        pings,
    }
}

fn key(s: &str) -> MessageKey {
    s.parse().unwrap()
}

fn frame(key: &str, payload: &[u8]) -> Bytes {
    let mut frame = key.as_bytes().to_vec();
    frame.push(b'\n');
    frame.extend_from_slice(payload);
    Bytes::from(frame)
}

/// Subscribes to every event kind, forwarding into a channel.
fn record_events(client: &DeviceClient) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in [
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::Reconnecting,
        EventKind::Unreachable,
        EventKind::Push,
    ] {
        let tx = tx.clone();
        let _ = client
            .subscribe(kind, move |event| {
                let _ = tx.send(event.clone());
            })
            .unwrap();
    }
    rx
}

async fn wait_for_event(
    events: &mut mpsc::UnboundedReceiver<Event>,
    expected: EventKind,
) -> Event {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if event.kind() == expected {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {expected:?}"))
}

#[tokio::test]
async fn request_receives_correlated_reply() {
    let mut harness = harness(0, |_| {});
    harness.client.connect().await.unwrap();
    let mut link = harness.links.recv().await.unwrap();

    let responder = tokio::spawn(async move {
        let request = link.outgoing.recv().await.unwrap();
        assert_eq!(&request[..], b"vol\n");

        // Deliver the reply in fragments to exercise reassembly on the
        // live receive path.
        let reply = frame("vol", b"42");
        let (head, tail) = reply.split_at(4);
        link.incoming
            .send(TransportEvent::Frame {
                bytes: Bytes::copy_from_slice(head),
                is_final: false,
            })
            .unwrap();
        link.incoming
            .send(TransportEvent::Frame {
                bytes: Bytes::copy_from_slice(tail),
                is_final: true,
            })
            .unwrap();
        link
    });

    let reply = harness.client.request(&key("vol"), b"", None).await.unwrap();
    assert_eq!(reply.decode::<u32>().unwrap(), 42);

    let _link = responder.await.unwrap();
    harness.client.dispose().await;
}

#[tokio::test]
async fn request_times_out_without_reply() {
    let mut harness = harness(0, |_| {});
    harness.client.connect().await.unwrap();
    let _link = harness.links.recv().await.unwrap();

    let err = harness
        .client
        .request(&key("vol"), b"", Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);

    // The timed-out exchange is gone: a retry opens a fresh one and
    // sends again.
    let _ = harness
        .client
        .request(&key("vol"), b"", Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(harness.sends.load(Ordering::SeqCst), 2);

    harness.client.dispose().await;
}

#[tokio::test]
async fn pending_request_fails_fast_when_connection_closes() {
    let mut harness = harness(0, |_| {});
    harness.client.connect().await.unwrap();
    let link = harness.links.recv().await.unwrap();

    let client = harness.client.clone();
    let pending = tokio::spawn(async move {
        client
            .request(&key("state"), b"", Some(Duration::from_secs(5)))
            .await
    });

    // Give the request time to register, then drop the connection.
    tokio::time::sleep(Duration::from_millis(20)).await;
    link.incoming.send(TransportEvent::Closed).unwrap();

    // The caller is failed within the cancellation propagation window,
    // not left waiting for its own deadline.
    let err = tokio::time::timeout(Duration::from_millis(50), pending)
        .await
        .expect("caller not released in time")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionLost);

    harness.client.dispose().await;
}

#[tokio::test]
async fn concurrent_requests_share_one_exchange() {
    let mut harness = harness(0, |_| {});
    harness.client.connect().await.unwrap();
    let mut link = harness.links.recv().await.unwrap();

    let responder = tokio::spawn(async move {
        let request = link.outgoing.recv().await.unwrap();
        assert_eq!(&request[..], b"vol\n");
        link.incoming
            .send(TransportEvent::Frame {
                bytes: frame("vol", b"42"),
                is_final: true,
            })
            .unwrap();
        link
    });

    let client = &harness.client;
    let vol = key("vol");
    let (a, b, c, d) = tokio::join!(
        client.request(&vol, b"", None),
        client.request(&vol, b"", None),
        client.request(&vol, b"", None),
        client.request(&vol, b"", None),
    );
    for reply in [a, b, c, d] {
        assert_eq!(&reply.unwrap().payload[..], b"42");
    }

    // Exactly one frame went to the device.
    assert_eq!(harness.sends.load(Ordering::SeqCst), 1);
    let mut link = responder.await.unwrap();
    assert!(link.outgoing.try_recv().is_err());

    harness.client.dispose().await;
}

#[tokio::test]
async fn cancelled_request_does_not_poison_its_key() {
    let mut harness = harness(0, |_| {});
    harness.client.connect().await.unwrap();
    let mut link = harness.links.recv().await.unwrap();

    // Start a request, let it send, then cancel it by dropping the
    // future before any reply arrives.
    {
        let client = harness.client.clone();
        let vol = key("vol");
        let pending = client.request(&vol, b"", None);
        tokio::pin!(pending);
        tokio::select! {
            biased;
            reply = &mut pending => panic!("unexpected reply: {reply:?}"),
            () = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
    }
    assert_eq!(harness.sends.load(Ordering::SeqCst), 1);

    // The cancelled exchange is fully withdrawn: a later request on the
    // same key opens a fresh one, sends again and completes.
    let responder = tokio::spawn(async move {
        let _cancelled = link.outgoing.recv().await.unwrap();
        let _fresh = link.outgoing.recv().await.unwrap();
        link.incoming
            .send(TransportEvent::Frame {
                bytes: frame("vol", b"5"),
                is_final: true,
            })
            .unwrap();
        link
    });

    let reply = harness.client.request(&key("vol"), b"", None).await.unwrap();
    assert_eq!(reply.decode::<u32>().unwrap(), 5);
    assert_eq!(harness.sends.load(Ordering::SeqCst), 2);

    let _link = responder.await.unwrap();
    harness.client.dispose().await;
}

#[tokio::test]
async fn unsolicited_messages_reach_push_subscribers() {
    let mut harness = harness(0, |_| {});
    let mut events = record_events(&harness.client);
    harness.client.connect().await.unwrap();
    let link = harness.links.recv().await.unwrap();

    link.incoming
        .send(TransportEvent::Frame {
            bytes: frame("power/state", b"\"standby\""),
            is_final: true,
        })
        .unwrap();

    let event = wait_for_event(&mut events, EventKind::Push).await;
    let Event::Push(message) = event else {
        panic!("expected push event");
    };
    assert_eq!(message.key, key("power/state"));
    assert_eq!(message.decode::<String>().unwrap(), "standby");

    harness.client.dispose().await;
}

#[tokio::test]
async fn malformed_message_is_dropped_without_killing_session() {
    let mut harness = harness(0, |_| {});
    harness.client.connect().await.unwrap();
    let mut link = harness.links.recv().await.unwrap();

    // No key separator: a protocol violation, logged and dropped.
    link.incoming
        .send(TransportEvent::Frame {
            bytes: Bytes::from_static(b"garbage-without-separator"),
            is_final: true,
        })
        .unwrap();

    // The session survives and still answers requests.
    let responder = tokio::spawn(async move {
        let _request = link.outgoing.recv().await.unwrap();
        link.incoming
            .send(TransportEvent::Frame {
                bytes: frame("vol", b"7"),
                is_final: true,
            })
            .unwrap();
        link
    });

    let reply = harness.client.request(&key("vol"), b"", None).await.unwrap();
    assert_eq!(reply.decode::<u32>().unwrap(), 7);
    assert_eq!(harness.client.state(), ConnectionState::Connected);

    let _link = responder.await.unwrap();
    harness.client.dispose().await;
}

#[tokio::test]
async fn reconnects_after_unexpected_loss() {
    let mut harness = harness(0, |_| {});
    let mut events = record_events(&harness.client);
    harness.client.connect().await.unwrap();
    let link = harness.links.recv().await.unwrap();
    wait_for_event(&mut events, EventKind::Connected).await;

    // Kill the connection out from under the client; the first
    // reconnect attempt fails, the second succeeds.
    harness.fail_next.store(1, Ordering::SeqCst);
    link.incoming.send(TransportEvent::Closed).unwrap();

    wait_for_event(&mut events, EventKind::Reconnecting).await;
    assert_eq!(harness.client.state(), ConnectionState::Reconnecting);
    wait_for_event(&mut events, EventKind::Unreachable).await;

    // The supervisor reconnects on its own.
    wait_for_event(&mut events, EventKind::Connected).await;
    assert_eq!(harness.client.state(), ConnectionState::Connected);

    // The new link answers requests; observers survived the reconnect.
    let mut link = harness.links.recv().await.unwrap();
    let responder = tokio::spawn(async move {
        let _request = link.outgoing.recv().await.unwrap();
        link.incoming
            .send(TransportEvent::Frame {
                bytes: frame("vol", b"11"),
                is_final: true,
            })
            .unwrap();
        link
    });
    let reply = harness.client.request(&key("vol"), b"", None).await.unwrap();
    assert_eq!(reply.decode::<u32>().unwrap(), 11);

    let _link = responder.await.unwrap();
    harness.client.dispose().await;
}

#[tokio::test]
async fn requests_fail_fast_while_reconnecting() {
    let mut harness = harness(0, |_| {});
    let mut events = record_events(&harness.client);
    harness.client.connect().await.unwrap();
    let link = harness.links.recv().await.unwrap();

    // Every reconnect attempt fails from here on.
    harness.fail_next.store(usize::MAX, Ordering::SeqCst);
    link.incoming.send(TransportEvent::Closed).unwrap();
    wait_for_event(&mut events, EventKind::Reconnecting).await;

    let err = harness
        .client
        .request(&key("vol"), b"", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionLost);

    // Failed attempts surface once as an unreachable event, not per
    // attempt.
    wait_for_event(&mut events, EventKind::Unreachable).await;

    harness.client.dispose().await;
}

#[tokio::test]
async fn dispose_is_idempotent_and_concurrent_safe() {
    let mut harness = harness(0, |_| {});
    harness.client.connect().await.unwrap();
    let _link = harness.links.recv().await.unwrap();

    let one = harness.client.clone();
    let two = harness.client.clone();
    tokio::join!(one.dispose(), two.dispose());
    harness.client.dispose().await;

    assert_eq!(harness.client.state(), ConnectionState::Disposed);
    let err = harness
        .client
        .request(&key("vol"), b"", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Disposed);
    assert!(matches!(
        harness.client.subscribe(EventKind::Push, |_| {}),
        Err(Error {
            kind: ErrorKind::Disposed,
            ..
        })
    ));
}

#[tokio::test]
async fn explicit_disconnect_does_not_trigger_reconnect() {
    let mut harness = harness(0, |_| {});
    harness.client.connect().await.unwrap();
    let _link = harness.links.recv().await.unwrap();

    harness.client.disconnect().await.unwrap();
    assert_eq!(harness.client.state(), ConnectionState::Disconnected);

    // No reconnect attempt follows a deliberate disconnect.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.links.try_recv().is_err());

    // A fresh connect establishes a new session.
    harness.client.connect().await.unwrap();
    assert!(harness.links.recv().await.is_some());
    assert_eq!(harness.client.state(), ConnectionState::Connected);

    harness.client.dispose().await;
}

#[tokio::test]
async fn first_connect_does_not_retry() {
    let mut harness = harness(1, |_| {});
    let err = harness.client.connect().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::HandshakeFailed);
    assert_eq!(harness.client.state(), ConnectionState::Disconnected);

    // No background attempts were started.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.links.try_recv().is_err());

    harness.client.dispose().await;
}

#[tokio::test]
async fn keepalive_pings_at_configured_interval() {
    let mut harness = harness(0, |config| {
        config.ping_interval = Some(Duration::from_millis(20));
    });
    harness.client.connect().await.unwrap();
    let _link = harness.links.recv().await.unwrap();

    tokio::time::sleep(Duration::from_millis(90)).await;
    assert!(
        harness.pings.load(Ordering::SeqCst) >= 2,
        "expected periodic keep-alive pings"
    );

    harness.client.dispose().await;
}

/// The protocols carry no correlation identifiers beyond the key, so an
/// unexpected device message on a pending key resolves that request.
/// This documents the single-key correlation assumption rather than
/// papering over it.
#[tokio::test]
async fn unexpected_message_on_pending_key_resolves_it() {
    let mut harness = harness(0, |_| {});
    harness.client.connect().await.unwrap();
    let link = harness.links.recv().await.unwrap();

    let client = harness.client.clone();
    let pending =
        tokio::spawn(async move { client.request(&key("vol"), b"", None).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A duplicate/unsolicited message on the same key, not a real
    // reply.
    link.incoming
        .send(TransportEvent::Frame {
            bytes: frame("vol", b"99"),
            is_final: true,
        })
        .unwrap();

    let reply = pending.await.unwrap().unwrap();
    assert_eq!(reply.decode::<u32>().unwrap(), 99);

    harness.client.dispose().await;
}
