//! Address resolution for resolver-assisted carriers (STCPR, SUDPH).

use async_trait::async_trait;
use overlay_core::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

/// A resolver's answer for one remote public key: either a set of
/// candidate local addresses to try in order, or a single already-resolved
/// remote address to dial directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedRecord {
    pub is_local: bool,
    #[serde(default)]
    pub addresses: Vec<String>,
    pub port: u16,
    #[serde(default)]
    pub remote_addr: Option<String>,
}

#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, carrier: &str, pk: PublicKey) -> Result<ResolvedRecord, String>;

    /// Register this visor's own bind address under the resolver so peers
    /// dialing it can find a record. STCP has no resolver and never calls
    /// this; STCPR/SUDPH call it once their raw listener is bound.
    async fn register(&self, carrier: &str, pk: PublicKey, bind_addr: &str) -> Result<(), String>;
}

/// In-memory resolver for tests and the demo binary.
#[derive(Default)]
pub struct MockResolver {
    records: RwLock<HashMap<(String, PublicKey), ResolvedRecord>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing `register`. Tests use this to set
    /// up candidate-address fallback scenarios.
    pub fn seed(&self, carrier: &str, pk: PublicKey, record: ResolvedRecord) {
        self.records
            .write()
            .unwrap()
            .insert((carrier.to_string(), pk), record);
    }
}

#[async_trait]
impl AddressResolver for MockResolver {
    async fn resolve(&self, carrier: &str, pk: PublicKey) -> Result<ResolvedRecord, String> {
        self.records
            .read()
            .unwrap()
            .get(&(carrier.to_string(), pk))
            .cloned()
            .ok_or_else(|| format!("no record for {pk} on {carrier}"))
    }

    async fn register(&self, carrier: &str, pk: PublicKey, bind_addr: &str) -> Result<(), String> {
        let (host, port) = bind_addr
            .rsplit_once(':')
            .ok_or_else(|| format!("malformed bind address: {bind_addr}"))?;
        let port: u16 = port.parse().map_err(|e| format!("bad port: {e}"))?;
        self.records.write().unwrap().insert(
            (carrier.to_string(), pk),
            ResolvedRecord {
                is_local: true,
                addresses: vec![host.to_string()],
                port,
                remote_addr: None,
            },
        );
        Ok(())
    }
}

/// Thin JSON client for a real address-resolver service.
pub struct HttpResolver {
    base_url: String,
    http: reqwest::Client,
}

impl HttpResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl AddressResolver for HttpResolver {
    async fn resolve(&self, carrier: &str, pk: PublicKey) -> Result<ResolvedRecord, String> {
        let url = format!("{}/resolve/{carrier}/{pk}", self.base_url.trim_end_matches('/'));
        debug!(url = %url, "resolving overlay address");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("resolver request failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("resolver returned {}", resp.status()));
        }
        resp.json::<ResolvedRecord>()
            .await
            .map_err(|e| format!("resolver response decode failed: {e}"))
    }

    async fn register(&self, carrier: &str, pk: PublicKey, bind_addr: &str) -> Result<(), String> {
        let url = format!("{}/register/{carrier}/{pk}", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "bind_addr": bind_addr }))
            .send()
            .await
            .map_err(|e| format!("resolver register failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("resolver returned {}", resp.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_resolver_roundtrip() {
        let resolver = MockResolver::new();
        let (pk, _sk) = overlay_core::SecretKey::generate();
        resolver.register("stcpr", pk, "127.0.0.1:9000").await.unwrap();
        let record = resolver.resolve("stcpr", pk).await.unwrap();
        assert!(record.is_local);
        assert_eq!(record.port, 9000);
    }

    #[tokio::test]
    async fn missing_record_is_an_error() {
        let resolver = MockResolver::new();
        let (pk, _sk) = overlay_core::SecretKey::generate();
        assert!(resolver.resolve("stcpr", pk).await.is_err());
    }
}
