//! [`GenericClient`]: the carrier-agnostic core shared by every carrier.
//!
//! Carrier-specific behavior (how a raw connection is opened, how the raw
//! listener is bound) is injected as [`crate::carriers::DialFn`]/
//! [`crate::carriers::ListenFn`] closures by [`ClientFactory`]; everything
//! else -- the accept loop, listener routing, port accounting, handshake
//! invocation -- lives here once.

use crate::carriers::{stcp, stcpr, sudph, DialFn, ListenFn, RawListener};
use crate::conn::WrappedConn;
use crate::event::{ConnEvent, EventSink, NullEventSink};
use crate::handshake::{initiator_handshake, responder_handshake};
use crate::latch::OnceLatch;
use crate::listener::Listener;
use crate::pktable::StaticPkTable;
use crate::porter::Porter;
use overlay_core::{CarrierType, HandshakeError, NetworkError, NetworkResult, OverlayAddress, PublicKey, SecretKey};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

/// Lightweight cooperative cancellation signal for in-flight dials. Mirrors
/// this codebase's cancel-channel idiom (see the gateway accept loop) but
/// as a cloneable broadcast-style flag rather than a consumed `mpsc`
/// receiver, since a single dial may need to observe it from more than one
/// `select!` branch (carrier dial, resolver call, handshake).
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once `cancel` has been called. If already cancelled,
    /// resolves immediately.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.notify.notified();
        tokio::pin!(notified);
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Carrier-agnostic client core: owns identity, the listener map, the raw
/// OS-level listener, and the background accept loop.
pub struct GenericClient {
    local_pk: PublicKey,
    local_sk: SecretKey,
    carrier: CarrierType,
    dial_fn: DialFn,
    listen_fn: ListenFn,
    porter: Porter,
    events: Arc<dyn EventSink>,

    listeners: RwLock<HashMap<u16, Arc<Listener>>>,
    raw_listener: StdMutex<Option<Arc<RawListener>>>,
    local_addr: StdMutex<Option<SocketAddr>>,

    listen_started: OnceLatch,
    started: AtomicBool,
    done: OnceLatch,
    closed: AtomicBool,
}

impl GenericClient {
    fn new(
        local_pk: PublicKey,
        local_sk: SecretKey,
        carrier: CarrierType,
        dial_fn: DialFn,
        listen_fn: ListenFn,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_pk,
            local_sk,
            carrier,
            dial_fn,
            listen_fn,
            porter: Porter::new(),
            events,
            listeners: RwLock::new(HashMap::new()),
            raw_listener: StdMutex::new(None),
            local_addr: StdMutex::new(None),
            listen_started: OnceLatch::new(),
            started: AtomicBool::new(false),
            done: OnceLatch::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn pk(&self) -> PublicKey {
        self.local_pk
    }

    pub fn sk(&self) -> &SecretKey {
        &self.local_sk
    }

    pub fn carrier_type(&self) -> CarrierType {
        self.carrier
    }

    /// Number of overlay ports currently reserved, listening or ephemeral.
    /// Exposed for leak-detection in tests.
    pub fn reserved_port_count(&self) -> usize {
        self.porter.in_use_count()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Bind the raw listener and spawn the accept loop. Idempotent: a
    /// second call is a no-op.
    pub async fn start(self: &Arc<Self>) -> NetworkResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }

        let raw = (self.listen_fn)().await?;
        let addr = raw.local_addr()?;
        *self.raw_listener.lock().unwrap() = Some(Arc::new(raw));
        *self.local_addr.lock().unwrap() = Some(addr);

        let this = self.clone();
        tokio::spawn(async move {
            this.accept_loop().await;
        });

        self.listen_started.fire();
        info!(addr = %addr, carrier = %self.carrier, "overlay client started");
        Ok(())
    }

    /// Blocks until `start` has bound the raw listener (or the client was
    /// closed without ever starting), then returns its address. Always
    /// awaits the signal first, even if this call raced a concurrent
    /// `close()`, so a caller never gets a spurious "not listening" for an
    /// address that did in fact come up.
    pub async fn local_addr(&self) -> NetworkResult<SocketAddr> {
        self.listen_started.wait().await;
        self.local_addr.lock().unwrap().ok_or(NetworkError::NotListening)
    }

    async fn accept_loop(self: Arc<Self>) {
        loop {
            if self.is_closed() {
                debug!("accept loop exiting: client closed");
                return;
            }

            let raw = match self.raw_listener.lock().unwrap().clone() {
                Some(r) => r,
                None => return,
            };

            let accept_result = tokio::select! {
                _ = self.done.wait() => {
                    debug!("accept loop exiting: close signalled");
                    return;
                }
                result = raw.accept() => result,
            };

            let (raw_conn, peer) = match accept_result {
                Ok(pair) => pair,
                Err(NetworkError::Io(e)) if is_transient_accept_error(&e) => {
                    debug!(error = %e, "transient accept error, continuing");
                    continue;
                }
                Err(NetworkError::Io(e)) => {
                    warn!(error = %e, "raw listener died, accept loop exiting");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "accept failed, accept loop exiting");
                    return;
                }
            };

            let this = self.clone();
            tokio::spawn(async move {
                this.handle_inbound(raw_conn, peer).await;
            });
        }
    }

    async fn handle_inbound(self: Arc<Self>, mut raw_conn: crate::conn::BoxedConn, peer: SocketAddr) {
        let local_pk = self.local_pk;
        let self_for_check = self.clone();
        let result = responder_handshake(&mut raw_conn, &self.local_sk, local_pk, move |port| {
            self_for_check.check_listener_sync(port)
        })
        .await;

        let (local_addr, remote_addr) = match result {
            Ok(pair) => pair,
            Err(e) => {
                if e.is_handshake_error() {
                    debug!(peer = %peer, error = %e, "handshake rejected (peer error, not fatal)");
                } else {
                    debug!(peer = %peer, error = %e, "handshake io error");
                }
                return;
            }
        };

        let wrapped = match WrappedConn::new(raw_conn, &self.local_sk, local_addr, remote_addr, None, self.events.clone()) {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "failed to derive session key for inbound connection");
                return;
            }
        };

        let listeners = self.listeners.read().await;
        let listener = match listeners.get(&local_addr.port) {
            Some(l) => l.clone(),
            None => {
                // Race: the listener was closed between the port_checker call
                // and this lookup. Nothing to deliver to; drop the connection.
                drop(listeners);
                let mut wrapped = wrapped;
                let _ = wrapped.close().await;
                return;
            }
        };
        drop(listeners);

        self.events.emit(ConnEvent::Opened {
            local: local_addr,
            remote: remote_addr,
            initiator: false,
        });

        if listener.introduce(wrapped).await.is_err() {
            debug!(port = local_addr.port, "listener closed mid-introduce, connection dropped");
        }
    }

    /// Synchronous listener-existence check used as the handshake's
    /// `port_checker`. Takes a blocking read on the listener map via
    /// `try_read` rather than `.await`, since the handshake closure the
    /// spec calls for is synchronous; the map is only ever write-locked
    /// briefly (insert/remove), so contention here is negligible.
    fn check_listener_sync(&self, port: u16) -> Result<(), HandshakeError> {
        match self.listeners.try_read() {
            Ok(guard) if guard.contains_key(&port) => Ok(()),
            _ => Err(HandshakeError::NoListener),
        }
    }

    /// Reserve an overlay port and register a fresh [`Listener`] for it.
    pub async fn listen(self: &Arc<Self>, port: u16) -> NetworkResult<Arc<Listener>> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        let lease = self.porter.reserve(port).ok_or(NetworkError::PortOccupied)?;
        let addr = OverlayAddress::new(self.local_pk, port);
        let listener = Arc::new(Listener::new(addr, self.carrier, lease));

        let mut listeners = self.listeners.write().await;
        if self.is_closed() {
            listener.close();
            return Err(NetworkError::Closed);
        }
        listeners.insert(port, listener.clone());
        Ok(listener)
    }

    /// Dial a remote overlay address, running the initiator handshake over
    /// a carrier-opened raw connection.
    pub async fn dial(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        remote_pk: PublicKey,
        remote_port: u16,
    ) -> NetworkResult<WrappedConn> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }

        let (local_port, lease) = self.porter.reserve_ephemeral();
        let lease = Arc::new(lease);

        let raw_conn = tokio::select! {
            _ = cancel.cancelled() => return Err(NetworkError::Cancelled),
            result = (self.dial_fn)(remote_pk, remote_port) => result?,
        };

        let mut raw_conn = raw_conn;
        let handshake_result = tokio::select! {
            _ = cancel.cancelled() => Err(HandshakeError::Timeout),
            result = initiator_handshake(
                &mut raw_conn,
                &self.local_sk,
                self.local_pk,
                local_port,
                remote_pk,
                remote_port,
            ) => result,
        };

        let (local_addr, remote_addr) = match handshake_result {
            Ok(pair) => pair,
            Err(e) => {
                lease.release();
                return Err(NetworkError::HandshakeFailed(e));
            }
        };

        let release_lease = lease.clone();
        let wrapped = WrappedConn::new(
            raw_conn,
            &self.local_sk,
            local_addr,
            remote_addr,
            Some(Arc::new(move || release_lease.release())),
            self.events.clone(),
        )?;

        self.events.emit(ConnEvent::Opened {
            local: local_addr,
            remote: remote_addr,
            initiator: true,
        });

        Ok(wrapped)
    }

    /// Close and forget a single listener, freeing its overlay port for
    /// reuse once the last reference to it drops.
    pub async fn close_listener(&self, port: u16) {
        let listener = self.listeners.write().await.remove(&port);
        if let Some(listener) = listener {
            listener.close();
        }
    }

    /// Idempotent. Signals `done`, closes the raw listener, and closes and
    /// removes every registered listener so each one's `PortLease` actually
    /// drops. Connections already handed to the application are left
    /// untouched -- the caller owns their lifecycle.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.done.fire();
        // Unblocks any `local_addr()` caller that arrived before `start()`
        // ran and now never will.
        self.listen_started.fire();
        *self.raw_listener.lock().unwrap() = None;

        let mut listeners = self.listeners.write().await;
        for (_, listener) in listeners.drain() {
            listener.close();
        }
        info!("overlay client closed");
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
    )
}

/// Builds a [`GenericClient`] wired up for a specific carrier. Carrier
/// selection is a runtime value (`CarrierType`), so the factory -- not
/// generics -- is where the dispatch happens.
pub struct ClientFactory {
    pub local_pk: PublicKey,
    pub local_sk: SecretKey,
    pub bind_addr: String,
    pub pk_table: Option<Arc<StaticPkTable>>,
    pub resolver: Option<Arc<dyn crate::addrresolver::AddressResolver>>,
    pub events: Arc<dyn EventSink>,
}

impl ClientFactory {
    pub fn new(local_pk: PublicKey, local_sk: SecretKey, bind_addr: impl Into<String>) -> Self {
        Self {
            local_pk,
            local_sk,
            bind_addr: bind_addr.into(),
            pk_table: None,
            resolver: None,
            events: Arc::new(NullEventSink),
        }
    }

    pub fn with_pk_table(mut self, table: Arc<StaticPkTable>) -> Self {
        self.pk_table = Some(table);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn crate::addrresolver::AddressResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn build(self, carrier: CarrierType) -> NetworkResult<Arc<GenericClient>> {
        let (dial_fn, listen_fn): (DialFn, ListenFn) = match carrier {
            CarrierType::Stcp => {
                let table = self
                    .pk_table
                    .clone()
                    .ok_or_else(|| NetworkError::ConfigError("STCP requires a static PK table".into()))?;
                (stcp::dial_fn(table), stcp::listen_fn(self.bind_addr.clone()))
            }
            CarrierType::Stcpr => {
                let resolver = self
                    .resolver
                    .clone()
                    .ok_or_else(|| NetworkError::ConfigError("STCPR requires a resolver".into()))?;
                (
                    stcpr::dial_fn(resolver.clone()),
                    stcpr::listen_fn(self.bind_addr.clone(), self.local_pk, resolver),
                )
            }
            CarrierType::Sudph => {
                let resolver = self
                    .resolver
                    .clone()
                    .ok_or_else(|| NetworkError::ConfigError("SUDPH requires a resolver".into()))?;
                (
                    sudph::dial_fn(resolver.clone()),
                    sudph::listen_fn(self.bind_addr.clone(), self.local_pk, resolver),
                )
            }
        };

        Ok(GenericClient::new(
            self.local_pk,
            self.local_sk,
            carrier,
            dial_fn,
            listen_fn,
            self.events,
        ))
    }
}

/// Convenience alias: every carrier is driven by the same generic core, so
/// "a client resolved for a given carrier" is just a `GenericClient`. Named
/// separately because the upstream design treats STCPR/SUDPH's
/// resolver-backed dial path as a distinct concept from STCP's static-table
/// path, even though this implementation shares one struct for both.
pub type ResolvedClient = GenericClient;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktable::StaticPkTable;

    fn stcp_factory(bind_addr: &str) -> (PublicKey, ClientFactory) {
        let (pk, sk) = SecretKey::generate();
        let table = Arc::new(StaticPkTable::new());
        (pk, ClientFactory::new(pk, sk, bind_addr).with_pk_table(table))
    }

    #[tokio::test]
    async fn loopback_stcp_dial_and_accept() {
        let (pk, factory) = stcp_factory("127.0.0.1:0");
        let table = factory.pk_table.clone().unwrap();
        let client = factory.build(CarrierType::Stcp).unwrap();
        client.start().await.unwrap();
        let addr = client.local_addr().await.unwrap();
        table.insert(pk, addr);

        let listener = client.listen(42).await.unwrap();

        let dial_client = client.clone();
        let cancel = CancellationToken::new();
        let dial_task = tokio::spawn(async move { dial_client.dial(&cancel, pk, 42).await });

        let accepted = listener.accept().await.unwrap();
        let dialed = dial_task.await.unwrap().unwrap();

        assert_eq!(dialed.local_addr().port, accepted.remote_addr().port);
        assert_eq!(dialed.remote_addr().port, accepted.local_addr().port);
        assert_eq!(accepted.local_addr().port, 42);
    }

    #[tokio::test]
    async fn second_listen_on_same_port_is_occupied() {
        let (_pk, factory) = stcp_factory("127.0.0.1:0");
        let client = factory.build(CarrierType::Stcp).unwrap();
        client.start().await.unwrap();
        let _first = client.listen(42).await.unwrap();
        let second = client.listen(42).await;
        assert!(matches!(second, Err(NetworkError::PortOccupied)));
    }

    #[tokio::test]
    async fn dial_to_missing_listener_fails_without_killing_accept_loop() {
        let (pk, factory) = stcp_factory("127.0.0.1:0");
        let table = factory.pk_table.clone().unwrap();
        let client = factory.build(CarrierType::Stcp).unwrap();
        client.start().await.unwrap();
        let addr = client.local_addr().await.unwrap();
        table.insert(pk, addr);

        let _listener = client.listen(1).await.unwrap();

        let cancel = CancellationToken::new();
        let result = client.dial(&cancel, pk, 99).await;
        assert!(matches!(result, Err(NetworkError::HandshakeFailed(HandshakeError::NoListener))));

        // the accept loop must still be alive: dialing port 1 should work.
        let dial_client = client.clone();
        let cancel2 = CancellationToken::new();
        let dial_task = tokio::spawn(async move { dial_client.dial(&cancel2, pk, 1).await });
        let _accepted = _listener.accept().await.unwrap();
        assert!(dial_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn close_wakes_blocked_accept() {
        let (_pk, factory) = stcp_factory("127.0.0.1:0");
        let client = factory.build(CarrierType::Stcp).unwrap();
        client.start().await.unwrap();
        let listener = client.listen(42).await.unwrap();

        let task = tokio::spawn(async move { listener.accept().await });
        tokio::task::yield_now().await;
        client.close().await;

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(NetworkError::Closed)));
    }

    #[tokio::test]
    async fn ephemeral_ports_are_released_after_many_dials() {
        let (pk, factory) = stcp_factory("127.0.0.1:0");
        let table = factory.pk_table.clone().unwrap();
        let client = factory.build(CarrierType::Stcp).unwrap();
        client.start().await.unwrap();
        let addr = client.local_addr().await.unwrap();
        table.insert(pk, addr);
        let listener = client.listen(7).await.unwrap();

        for _ in 0..20 {
            let dial_client = client.clone();
            let cancel = CancellationToken::new();
            let dial_task = tokio::spawn(async move { dial_client.dial(&cancel, pk, 7).await });
            let mut accepted = listener.accept().await.unwrap();
            let mut dialed = dial_task.await.unwrap().unwrap();
            dialed.close().await.unwrap();
            accepted.close().await.unwrap();
        }

        assert_eq!(client.porter.in_use_count(), 1); // only the listener's port 7 remains
    }

    #[tokio::test]
    async fn closing_a_listener_releases_its_port() {
        let (_pk, factory) = stcp_factory("127.0.0.1:0");
        let client = factory.build(CarrierType::Stcp).unwrap();
        client.start().await.unwrap();
        let listener = client.listen(55).await.unwrap();
        assert_eq!(client.porter.in_use_count(), 1);

        client.close_listener(55).await;
        drop(listener); // last owner of the Listener (and its PortLease)
        assert_eq!(client.porter.in_use_count(), 0);
    }

    #[tokio::test]
    async fn client_close_releases_all_listener_ports() {
        let (_pk, factory) = stcp_factory("127.0.0.1:0");
        let client = factory.build(CarrierType::Stcp).unwrap();
        client.start().await.unwrap();
        let listener_a = client.listen(60).await.unwrap();
        let listener_b = client.listen(61).await.unwrap();
        assert_eq!(client.porter.in_use_count(), 2);

        client.close().await;
        drop(listener_a);
        drop(listener_b);
        assert_eq!(client.porter.in_use_count(), 0);
    }
}
