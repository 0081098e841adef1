//! `overlay keys` — list stored identities with their public keys.

use crate::keystore::KeyStore;
use anyhow::Result;

pub async fn run() -> Result<()> {
    let keystore = KeyStore::default_location()?;
    let names = keystore.list()?;

    if names.is_empty() {
        println!("No identities stored yet. Run `overlay keygen <name>` to create one.");
        return Ok(());
    }

    for name in names {
        let (pk, _sk) = keystore.load(&name)?;
        println!("{name}\t{pk}");
    }

    Ok(())
}
