//! Static public-key-to-address table consumed by the STCP carrier.

use overlay_core::PublicKey;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

/// An in-memory, synchronously queried PK -> address table. STCP has no
/// external service to consult, so dialing is only ever as good as this
/// table's contents.
#[derive(Default)]
pub struct StaticPkTable {
    entries: RwLock<HashMap<PublicKey, SocketAddr>>,
}

impl StaticPkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (PublicKey, SocketAddr)>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    pub fn insert(&self, pk: PublicKey, addr: SocketAddr) {
        self.entries.write().unwrap().insert(pk, addr);
    }

    pub fn lookup(&self, pk: &PublicKey) -> Option<SocketAddr> {
        self.entries.read().unwrap().get(pk).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_inserted_entry() {
        let table = StaticPkTable::new();
        let (pk, _sk) = overlay_core::SecretKey::generate();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        table.insert(pk, addr);
        assert_eq!(table.lookup(&pk), Some(addr));
    }

    #[test]
    fn lookup_miss_returns_none() {
        let table = StaticPkTable::new();
        let (pk, _sk) = overlay_core::SecretKey::generate();
        assert_eq!(table.lookup(&pk), None);
    }
}
