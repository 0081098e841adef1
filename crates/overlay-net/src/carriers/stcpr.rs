//! STCPR: TCP dialed via an address resolver, with candidate-address
//! fallback when the resolver reports multiple local addresses for a peer.

use super::{DialFn, ListenFn, RawListener};
use crate::addrresolver::AddressResolver;
use overlay_core::{NetworkError, PublicKey};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

const CARRIER_TAG: &str = "stcpr";

pub fn dial_fn(resolver: Arc<dyn AddressResolver>) -> DialFn {
    Arc::new(move |pk: PublicKey, _port: u16| {
        let resolver = resolver.clone();
        Box::pin(async move {
            let record = resolver
                .resolve(CARRIER_TAG, pk)
                .await
                .map_err(NetworkError::ResolveFailed)?;

            if record.is_local {
                let mut last_err = None;
                for host in &record.addresses {
                    let addr = format!("{host}:{}", record.port);
                    match TcpStream::connect(&addr).await {
                        Ok(stream) => return Ok(Box::new(stream) as crate::conn::BoxedConn),
                        Err(e) => {
                            warn!(addr = %addr, error = %e, "stcpr candidate dial failed, trying next");
                            last_err = Some(e);
                        }
                    }
                }
                Err(NetworkError::DialFailed(format!(
                    "all {} stcpr candidates failed for {pk}: {:?}",
                    record.addresses.len(),
                    last_err
                )))
            } else {
                let remote = record
                    .remote_addr
                    .ok_or_else(|| NetworkError::ResolveFailed("remote record missing remote_addr".into()))?;
                let addr = if remote.contains(':') {
                    remote
                } else {
                    format!("{remote}:{}", record.port)
                };
                let stream = TcpStream::connect(&addr)
                    .await
                    .map_err(|e| NetworkError::DialFailed(format!("TCP connect to {addr}: {e}")))?;
                Ok(Box::new(stream) as crate::conn::BoxedConn)
            }
        })
    })
}

pub fn listen_fn(bind_addr: String, local_pk: PublicKey, resolver: Arc<dyn AddressResolver>) -> ListenFn {
    Arc::new(move || {
        let bind_addr = bind_addr.clone();
        let resolver = resolver.clone();
        Box::pin(async move {
            let listener = TcpListener::bind(&bind_addr).await.map_err(NetworkError::Io)?;
            let actual = listener.local_addr().map_err(NetworkError::Io)?;
            resolver
                .register(CARRIER_TAG, local_pk, &actual.to_string())
                .await
                .map_err(NetworkError::ResolveFailed)?;
            debug!(addr = %actual, "stcpr listener registered with resolver");
            Ok(RawListener::Tcp(listener))
        })
    })
}
