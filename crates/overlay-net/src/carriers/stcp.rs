//! STCP: direct TCP to a statically configured peer table. No external
//! coordination service is involved.

use super::{DialFn, ListenFn, RawListener};
use crate::pktable::StaticPkTable;
use overlay_core::{NetworkError, PublicKey};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

pub fn dial_fn(table: Arc<StaticPkTable>) -> DialFn {
    Arc::new(move |pk: PublicKey, _port: u16| {
        let table = table.clone();
        Box::pin(async move {
            let addr = table
                .lookup(&pk)
                .ok_or_else(|| NetworkError::DialFailed(format!("no STCP table entry for {pk}")))?;
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| NetworkError::DialFailed(format!("TCP connect to {addr}: {e}")))?;
            Ok(Box::new(stream) as crate::conn::BoxedConn)
        })
    })
}

pub fn listen_fn(bind_addr: String) -> ListenFn {
    Arc::new(move || {
        let bind_addr = bind_addr.clone();
        Box::pin(async move {
            let listener = TcpListener::bind(&bind_addr)
                .await
                .map_err(|e| NetworkError::Io(e))?;
            Ok(RawListener::Tcp(listener))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_without_table_entry_fails() {
        let table = Arc::new(StaticPkTable::new());
        let dial = dial_fn(table);
        let (pk, _sk) = overlay_core::SecretKey::generate();
        let result = dial(pk, 42).await;
        assert!(matches!(result, Err(NetworkError::DialFailed(_))));
    }

    #[tokio::test]
    async fn listen_then_dial_roundtrip() {
        let table = Arc::new(StaticPkTable::new());
        let listen = listen_fn("127.0.0.1:0".to_string());
        let raw = listen().await.unwrap();
        let bound = raw.local_addr().unwrap();

        let (pk, _sk) = overlay_core::SecretKey::generate();
        table.insert(pk, bound);

        let dial = dial_fn(table);
        let (accepted, dialed) = tokio::join!(raw.accept(), dial(pk, 42));
        assert!(accepted.is_ok());
        assert!(dialed.is_ok());
    }
}
