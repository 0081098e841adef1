//! Shared wiring between the `listen` and `dial` commands: turn a loaded
//! [`ClientConfig`] plus an identity into a ready-to-build [`ClientFactory`].

use anyhow::{anyhow, Result};
use overlay_net::addrresolver::HttpResolver;
use overlay_net::config::ClientConfig;
use overlay_net::pktable::StaticPkTable;
use overlay_net::{CarrierType, PublicKey, SecretKey};
use std::net::SocketAddr;
use std::sync::Arc;

pub fn build_factory(
    cfg: &ClientConfig,
    pk: PublicKey,
    sk: SecretKey,
    static_peers: &[(PublicKey, SocketAddr)],
) -> Result<overlay_net::client::ClientFactory> {
    let factory = overlay_net::client::ClientFactory::new(pk, sk, cfg.bind_addr.clone());

    let factory = match cfg.carrier {
        CarrierType::Stcp => {
            let table = Arc::new(StaticPkTable::from_entries(static_peers.iter().copied()));
            factory.with_pk_table(table)
        }
        CarrierType::Stcpr | CarrierType::Sudph => {
            let url = cfg
                .resolver_url
                .clone()
                .ok_or_else(|| anyhow!("carrier {} requires a resolver_url", cfg.carrier))?;
            factory.with_resolver(Arc::new(HttpResolver::new(url)))
        }
    };

    Ok(factory)
}

/// Parse `pk=host:port` pairs from `--peer` flags into static table entries.
pub fn parse_peer_flags(raw: &[String]) -> Result<Vec<(PublicKey, SocketAddr)>> {
    raw.iter()
        .map(|entry| {
            let (pk_str, addr_str) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("--peer must be `pk=host:port`, got `{entry}`"))?;
            let pk: PublicKey = pk_str.parse().map_err(|_| anyhow!("invalid public key `{pk_str}`"))?;
            let addr: SocketAddr = addr_str.parse().map_err(|_| anyhow!("invalid address `{addr_str}`"))?;
            Ok((pk, addr))
        })
        .collect()
}
