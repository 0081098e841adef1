//! `overlay dial` — connect to a peer's overlay port, send one line, print
//! whatever comes back, then close.

use crate::client_setup::{build_factory, parse_peer_flags};
use crate::keystore::KeyStore;
use anyhow::{Context, Result};
use overlay_net::client::CancellationToken;
use overlay_net::config::{ClientConfig, ClientConfigOverrides};
use overlay_net::{CarrierType, PublicKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

#[allow(clippy::too_many_arguments)]
pub async fn run(
    identity: &str,
    peer: &str,
    port: u16,
    message: &str,
    config_path: Option<&str>,
    carrier: Option<CarrierType>,
    bind_addr: Option<String>,
    resolver_url: Option<String>,
    peers: &[String],
) -> Result<()> {
    let keystore = KeyStore::default_location()?;
    let (pk, sk) = keystore
        .load(identity)
        .with_context(|| format!("loading identity '{identity}' (run `overlay keygen {identity}` first)"))?;
    let peer_pk: PublicKey = peer.parse().context("invalid peer public key")?;

    let overrides = ClientConfigOverrides {
        carrier,
        bind_addr,
        resolver_url,
        ..Default::default()
    };
    let cfg = ClientConfig::load(config_path.map(std::path::Path::new), overrides)?;
    let static_peers = parse_peer_flags(peers)?;

    let factory = build_factory(&cfg, pk, sk, &static_peers)?;
    let client = factory.build(cfg.carrier)?;
    client.start().await?;

    let cancel = CancellationToken::new();
    info!(peer = %peer_pk, port, "dialing");
    let mut conn = client.dial(&cancel, peer_pk, port).await?;

    conn.write_all(message.as_bytes()).await?;
    println!("sent {} bytes to {peer_pk}:{port}", message.len());

    let mut buf = [0u8; 4096];
    let n = conn.read(&mut buf).await?;
    println!("received: {}", String::from_utf8_lossy(&buf[..n]));

    conn.close().await?;
    client.close().await;
    Ok(())
}
