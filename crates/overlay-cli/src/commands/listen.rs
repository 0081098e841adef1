//! `overlay listen` — bring up a client, open one overlay port, and echo
//! back whatever each inbound connection sends until interrupted.

use crate::client_setup::{build_factory, parse_peer_flags};
use crate::keystore::KeyStore;
use anyhow::{Context, Result};
use overlay_net::config::{ClientConfig, ClientConfigOverrides};
use overlay_net::CarrierType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

#[allow(clippy::too_many_arguments)]
pub async fn run(
    identity: &str,
    port: u16,
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
    let addr = client.local_addr().await?;
    info!(pk = %pk, addr = %addr, overlay_port = port, carrier = %cfg.carrier, "listening");
    println!("Listening as {pk} on overlay port {port} (carrier address {addr})");

    let listener = client.listen(port).await?;

    let accept_loop = async {
        loop {
            match listener.accept().await {
                Ok(mut conn) => {
                    let remote = conn.remote_addr();
                    info!(remote = %remote, "accepted connection");
                    tokio::spawn(async move {
                        let mut buf = [0u8; 4096];
                        loop {
                            match conn.read(&mut buf).await {
                                Ok(0) => break,
                                Ok(n) => {
                                    if conn.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    warn!(remote = %remote, error = %e, "read failed");
                                    break;
                                }
                            }
                        }
                        let _ = conn.close().await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept loop ending");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = accept_loop => {}
        _ = crate::commands::shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    client.close().await;
    Ok(())
}
