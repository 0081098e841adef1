//! `overlay keygen [name]` — generate an Ed25519 identity.

use crate::keystore::KeyStore;
use anyhow::Result;
use tracing::info;

pub async fn run(name: &str) -> Result<()> {
    let keystore = KeyStore::default_location()?;
    let pk = keystore.generate(name)?;

    info!(name, pk = %pk, "identity generated");
    println!("Generated identity '{name}'");
    println!("  Public key: {pk}");

    Ok(())
}
