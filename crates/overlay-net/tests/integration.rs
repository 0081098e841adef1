//! End-to-end scenarios run against the public crate surface only (no
//! `crate::` access) -- these are the literal walkthroughs the client core
//! is built to satisfy, one test per scenario.

use overlay_net::addrresolver::{AddressResolver, MockResolver, ResolvedRecord};
use overlay_net::client::{CancellationToken, ClientFactory};
use overlay_net::event::{ConnEvent, EventBroadcaster};
use overlay_net::pktable::StaticPkTable;
use overlay_net::{CarrierType, HandshakeError, NetworkError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn stcp_factory(bind_addr: &str) -> (overlay_net::PublicKey, ClientFactory) {
    let (pk, sk) = overlay_net::SecretKey::generate();
    let table = Arc::new(StaticPkTable::new());
    (pk, ClientFactory::new(pk, sk, bind_addr).with_pk_table(table))
}

/// Scenario 1: loopback STCP. A dials itself on an overlay port it is
/// listening on; both ends see the expected (ephemeral, 42)/(42, ephemeral)
/// port pairing.
#[tokio::test]
async fn loopback_stcp() {
    let (pk, factory) = stcp_factory("127.0.0.1:0");
    let table = factory.pk_table.clone().unwrap();
    let client = factory.build(CarrierType::Stcp).unwrap();
    client.start().await.unwrap();
    let bound = client.local_addr().await.unwrap();
    table.insert(pk, bound);

    let listener = client.listen(42).await.unwrap();

    let dialer = client.clone();
    let cancel = CancellationToken::new();
    let dial_task = tokio::spawn(async move { dialer.dial(&cancel, pk, 42).await });

    let accepted = listener.accept().await.unwrap();
    let dialed = dial_task.await.unwrap().unwrap();

    assert_eq!(dialed.local_addr().port, accepted.remote_addr().port);
    assert_eq!(dialed.remote_addr().port, accepted.local_addr().port);
    assert_eq!(accepted.local_addr().port, 42);
    assert_eq!(dialed.remote_addr().port, 42);
}

/// The handshake alone proves the peers agree on addresses, but not that
/// they agree on the AEAD session key -- each direction must actually
/// decrypt what the other direction sealed, on both sides of the
/// connection.
#[tokio::test]
async fn loopback_stcp_exchanges_data_both_directions() {
    let (pk, factory) = stcp_factory("127.0.0.1:0");
    let table = factory.pk_table.clone().unwrap();
    let client = factory.build(CarrierType::Stcp).unwrap();
    client.start().await.unwrap();
    let bound = client.local_addr().await.unwrap();
    table.insert(pk, bound);

    let listener = client.listen(42).await.unwrap();

    let dialer = client.clone();
    let cancel = CancellationToken::new();
    let dial_task = tokio::spawn(async move {
        let mut conn = dialer.dial(&cancel, pk, 42).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        conn.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
    });

    let mut accepted = listener.accept().await.unwrap();
    let mut ping = [0u8; 4];
    accepted.read_exact(&mut ping).await.unwrap();
    assert_eq!(&ping, b"ping");
    accepted.write_all(b"pong").await.unwrap();

    dial_task.await.unwrap();
}

/// Closing a `WrappedConn` must emit a `ConnEvent::Closed` for it, matching
/// the `Opened` event already emitted when the handshake completes.
#[tokio::test]
async fn closing_a_connection_emits_closed_event() {
    let (pk, factory) = stcp_factory("127.0.0.1:0");
    let broadcaster = Arc::new(EventBroadcaster::new());
    let mut events = broadcaster.subscribe();
    let table = factory.pk_table.clone().unwrap();
    let client = factory.with_events(broadcaster).build(CarrierType::Stcp).unwrap();
    client.start().await.unwrap();
    let bound = client.local_addr().await.unwrap();
    table.insert(pk, bound);

    let listener = client.listen(42).await.unwrap();
    let dialer = client.clone();
    let cancel = CancellationToken::new();
    let dial_task = tokio::spawn(async move { dialer.dial(&cancel, pk, 42).await });
    let mut accepted = listener.accept().await.unwrap();
    let mut dialed = dial_task.await.unwrap().unwrap();

    // Drain the two `Opened` events from the handshake on each side.
    assert!(matches!(events.recv().await.unwrap(), ConnEvent::Opened { .. }));
    assert!(matches!(events.recv().await.unwrap(), ConnEvent::Opened { .. }));

    dialed.close().await.unwrap();
    assert!(matches!(events.recv().await.unwrap(), ConnEvent::Closed { .. }));

    accepted.close().await.unwrap();
    assert!(matches!(events.recv().await.unwrap(), ConnEvent::Closed { .. }));
}

/// Scenario 2: a second `listen` on an already-occupied overlay port fails
/// with `PortOccupied` rather than silently replacing the first listener.
#[tokio::test]
async fn port_occupied() {
    let (_pk, factory) = stcp_factory("127.0.0.1:0");
    let client = factory.build(CarrierType::Stcp).unwrap();
    client.start().await.unwrap();

    let _first = client.listen(42).await.unwrap();
    let second = client.listen(42).await;
    assert!(matches!(second, Err(NetworkError::PortOccupied)));
}

/// Scenario 3: dialing a peer with no listener on the requested overlay
/// port fails with `HandshakeFailed(NoListener)`, and the peer's accept
/// loop survives to serve later dials on a port it does listen on.
#[tokio::test]
async fn no_listener_on_peer() {
    let (pk, factory) = stcp_factory("127.0.0.1:0");
    let table = factory.pk_table.clone().unwrap();
    let client = factory.build(CarrierType::Stcp).unwrap();
    client.start().await.unwrap();
    let bound = client.local_addr().await.unwrap();
    table.insert(pk, bound);

    let listener = client.listen(1).await.unwrap();

    let cancel = CancellationToken::new();
    let missing = client.dial(&cancel, pk, 99).await;
    assert!(matches!(
        missing,
        Err(NetworkError::HandshakeFailed(HandshakeError::NoListener))
    ));

    let dialer = client.clone();
    let cancel2 = CancellationToken::new();
    let dial_task = tokio::spawn(async move { dialer.dial(&cancel2, pk, 1).await });
    let accepted = listener.accept().await;
    assert!(accepted.is_ok());
    assert!(dial_task.await.unwrap().is_ok());
}

/// Scenario 4: closing the client while a task is blocked in `accept()`
/// wakes that task with `Closed` within a bounded time, rather than hanging.
#[tokio::test]
async fn close_during_accept() {
    let (_pk, factory) = stcp_factory("127.0.0.1:0");
    let client = factory.build(CarrierType::Stcp).unwrap();
    client.start().await.unwrap();
    let listener = client.listen(42).await.unwrap();

    let task = tokio::spawn(async move { listener.accept().await });
    tokio::task::yield_now().await;
    client.close().await;

    let result = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("accept() must return once the client is closed")
        .unwrap();
    assert!(matches!(result, Err(NetworkError::Closed)));
}

/// Scenario 5: many sequential dial/accept/close cycles on the same
/// ephemeral-port-backed connection never leave the port table growing
/// unboundedly -- only the listener's own reserved port remains afterward.
#[tokio::test]
async fn ephemeral_port_exhaustion_free() {
    let (pk, factory) = stcp_factory("127.0.0.1:0");
    let table = factory.pk_table.clone().unwrap();
    let client = factory.build(CarrierType::Stcp).unwrap();
    client.start().await.unwrap();
    let bound = client.local_addr().await.unwrap();
    table.insert(pk, bound);
    let listener = client.listen(7).await.unwrap();

    for _ in 0..50 {
        let dialer = client.clone();
        let cancel = CancellationToken::new();
        let dial_task = tokio::spawn(async move { dialer.dial(&cancel, pk, 7).await });
        let mut accepted = listener.accept().await.unwrap();
        let mut dialed = dial_task.await.unwrap().unwrap();
        dialed.close().await.unwrap();
        accepted.close().await.unwrap();
    }

    assert_eq!(client.reserved_port_count(), 1);
}

/// Closing a listener must free its reserved overlay port, not just stop
/// accepting on it -- the client should be able to `listen` on the same
/// port again afterward.
#[tokio::test]
async fn closed_listener_port_can_be_reused() {
    let (_pk, factory) = stcp_factory("127.0.0.1:0");
    let client = factory.build(CarrierType::Stcp).unwrap();
    client.start().await.unwrap();

    let listener = client.listen(42).await.unwrap();
    client.close_listener(42).await;
    drop(listener);

    assert_eq!(client.reserved_port_count(), 0);
    let relistened = client.listen(42).await;
    assert!(relistened.is_ok());
}

/// Scenario 6 (STCPR): the resolver hands back two candidate addresses for
/// a peer, the first of which refuses connections. Dialing still succeeds
/// by falling through to the second candidate.
#[tokio::test]
async fn resolver_candidate_fallback_stcpr() {
    let resolver = Arc::new(MockResolver::new());
    let (listener_pk, listener_sk) = overlay_net::SecretKey::generate();
    let listener_factory = ClientFactory::new(listener_pk, listener_sk, "127.0.0.1:0")
        .with_resolver(resolver.clone() as Arc<dyn AddressResolver>);
    let listener_client = listener_factory.build(CarrierType::Stcpr).unwrap();
    listener_client.start().await.unwrap();
    let listener = listener_client.listen(9000).await.unwrap();

    let bound = listener_client.local_addr().await.unwrap();
    // Seed a bad candidate ahead of the real one so the dialer must fall
    // through before it can succeed.
    resolver.seed(
        "stcpr",
        listener_pk,
        ResolvedRecord {
            is_local: true,
            addresses: vec!["127.0.0.1:1".to_string(), bound.ip().to_string()],
            port: bound.port(),
            remote_addr: None,
        },
    );

    let (dialer_pk, dialer_sk) = overlay_net::SecretKey::generate();
    let dialer_factory =
        ClientFactory::new(dialer_pk, dialer_sk, "127.0.0.1:0").with_resolver(resolver as Arc<dyn AddressResolver>);
    let dialer_client = dialer_factory.build(CarrierType::Stcpr).unwrap();
    dialer_client.start().await.unwrap();

    let cancel = CancellationToken::new();
    let dial_task = tokio::spawn(async move { dialer_client.dial(&cancel, listener_pk, 9000).await });

    let accepted = listener.accept().await;
    let dialed = dial_task.await.unwrap();
    assert!(accepted.is_ok());
    assert!(dialed.is_ok());
}
