//! [`Listener`]: one overlay port's inbound connection queue.

use crate::conn::WrappedConn;
use crate::latch::OnceLatch;
use crate::porter::PortLease;
use overlay_core::{CarrierType, NetworkError, NetworkResult, OverlayAddress};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// A listener for inbound connections on one overlay port.
///
/// Created by [`crate::client::GenericClient::listen`]; the accept loop
/// offers newly handshaken connections to it via [`Listener::introduce`].
/// Dropping all application-side clones without calling `close` still
/// releases the port once the last handle is dropped, via the held
/// [`PortLease`].
pub struct Listener {
    addr: OverlayAddress,
    carrier: CarrierType,
    inbound_rx: Mutex<mpsc::Receiver<WrappedConn>>,
    inbound_tx: mpsc::Sender<WrappedConn>,
    done: OnceLatch,
    closed: std::sync::atomic::AtomicBool,
    // Serializes `introduce` against `close` so a send that raced a close
    // either lands before the channel is torn down or loses to `done`.
    introduce_lock: Mutex<()>,
    _port_lease: PortLease,
}

impl Listener {
    pub(crate) fn new(addr: OverlayAddress, carrier: CarrierType, port_lease: PortLease) -> Self {
        // Capacity 1 approximates the unbuffered/rendezvous channel the
        // upstream design calls for: at most one connection may be
        // in flight between the accept loop and the application.
        let (inbound_tx, inbound_rx) = mpsc::channel(1);
        Self {
            addr,
            carrier,
            inbound_rx: Mutex::new(inbound_rx),
            inbound_tx,
            done: OnceLatch::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
            introduce_lock: Mutex::new(()),
            _port_lease: port_lease,
        }
    }

    pub fn addr(&self) -> OverlayAddress {
        self.addr
    }

    pub fn network(&self) -> CarrierType {
        self.carrier
    }

    /// Accept the next handshaken inbound connection. Returns `Closed` once
    /// the listener has been closed and no connection is pending.
    pub async fn accept(&self) -> NetworkResult<WrappedConn> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = self.done.wait() => Err(NetworkError::Closed),
            result = rx.recv() => result.ok_or(NetworkError::Closed),
        }
    }

    /// Offer a freshly handshaken connection to the application. Called by
    /// the accept loop. If the listener is closing concurrently, returns
    /// `Closed` so the caller closes the connection itself instead of
    /// leaking it.
    pub(crate) async fn introduce(&self, conn: WrappedConn) -> NetworkResult<()> {
        let _guard = self.introduce_lock.lock().await;
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(NetworkError::Closed);
        }
        tokio::select! {
            _ = self.done.wait() => Err(NetworkError::Closed),
            result = self.inbound_tx.send(conn) => {
                result.map_err(|_| NetworkError::Closed)
            }
        }
    }

    /// Close the listener. Idempotent: only the first call has effect. The
    /// port release happens when the last `Arc`/owner of this `Listener`
    /// (and its embedded `PortLease`) is dropped -- `GenericClient::close`
    /// and `GenericClient::close_listener` both remove their map entry
    /// before calling this, so that drop happens right away rather than
    /// only when the client itself is dropped.
    pub fn close(&self) {
        if self.closed.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return;
        }
        self.done.fire();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::porter::Porter;
    use overlay_core::SecretKey;

    fn test_listener(port: u16) -> Listener {
        let porter = Porter::new();
        let lease = porter.reserve(port).unwrap();
        let (pk, _sk) = SecretKey::generate();
        Listener::new(OverlayAddress::new(pk, port), CarrierType::Stcp, lease)
    }

    #[tokio::test]
    async fn close_wakes_pending_accept() {
        let listener = Arc::new(test_listener(42));
        let l2 = listener.clone();
        let task = tokio::spawn(async move { l2.accept().await });
        // give the accept task a chance to start waiting
        tokio::task::yield_now().await;
        listener.close();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(NetworkError::Closed)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let listener = test_listener(42);
        listener.close();
        listener.close();
        assert!(listener.is_closed());
    }
}
