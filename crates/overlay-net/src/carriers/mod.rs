//! Carrier drivers: the only carrier-specific code in this crate.
//!
//! Each carrier supplies a `DialFn` and a `ListenFn` -- two small
//! function-valued parameters injected into [`crate::client::GenericClient`]
//! -- rather than a `dyn Trait` object, since the handshake and framing code
//! they'd need to call through is `async fn`-based and not object-safe
//! without boxing every call. This mirrors the enum-dispatch style this
//! codebase already uses at its own transport boundary.

pub mod stcp;
pub mod stcpr;
pub mod sudph;

use crate::conn::BoxedConn;
use overlay_core::{NetworkError, PublicKey};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpListener;

pub type DialFuture = Pin<Box<dyn Future<Output = Result<BoxedConn, NetworkError>> + Send>>;
pub type ListenFuture = Pin<Box<dyn Future<Output = Result<RawListener, NetworkError>> + Send>>;

/// Opens a raw connection to `pk`. The overlay port being dialed is passed
/// through so resolver-backed carriers can include it in their lookup, even
/// though it plays no role in establishing the raw socket itself.
pub type DialFn = Arc<dyn Fn(PublicKey, u16) -> DialFuture + Send + Sync>;

/// Binds this visor's raw listener for the carrier, registering it with any
/// external coordination service (resolver) the carrier needs.
pub type ListenFn = Arc<dyn Fn() -> ListenFuture + Send + Sync>;

/// The bound raw listener, carrier-dispatched. STCP/STCPR share plain TCP;
/// SUDPH produces reliable streams over UDP hole-punched datagram pairs.
pub enum RawListener {
    Tcp(TcpListener),
    Sudph(sudph::SudphListener),
}

impl RawListener {
    pub async fn accept(&self) -> Result<(BoxedConn, SocketAddr), NetworkError> {
        match self {
            RawListener::Tcp(l) => {
                let (stream, addr) = l.accept().await?;
                Ok((Box::new(stream), addr))
            }
            RawListener::Sudph(l) => l.accept().await,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        match self {
            RawListener::Tcp(l) => Ok(l.local_addr()?),
            RawListener::Sudph(l) => l.local_addr(),
        }
    }
}
