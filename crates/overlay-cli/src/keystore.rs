//! File-based key storage for the overlay CLI.
//!
//! Keys live at `~/.overlay-cli/keys/<name>.key` as the hex-encoded 32-byte
//! Ed25519 seed, mirroring the directory layout and permission handling of
//! wsh's keystore but without the SSH-wire-format public key file -- the
//! overlay protocol's own hex encoding of a [`overlay_core::PublicKey`] is
//! already the canonical external representation.

use anyhow::{anyhow, Context, Result};
use overlay_core::{PublicKey, SecretKey};
use std::fs;
use std::path::PathBuf;

pub struct KeyStore {
    base_dir: PathBuf,
}

impl KeyStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
        Ok(Self::new(home.join(".overlay-cli").join("keys")))
    }

    fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            fs::create_dir_all(&self.base_dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&self.base_dir, fs::Permissions::from_mode(0o700))?;
            }
        }
        Ok(())
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.key"))
    }

    /// Generate and persist a fresh identity under `name`.
    pub fn generate(&self, name: &str) -> Result<PublicKey> {
        self.ensure_dir()?;
        let path = self.key_path(name);
        if path.exists() {
            return Err(anyhow!("key '{name}' already exists"));
        }

        let (pk, sk) = SecretKey::generate();
        fs::write(&path, hex::encode(sk.seed())).with_context(|| format!("writing key file {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(pk)
    }

    /// Load a previously generated identity.
    pub fn load(&self, name: &str) -> Result<(PublicKey, SecretKey)> {
        let path = self.key_path(name);
        let content = fs::read_to_string(&path).with_context(|| format!("no key named '{name}' ({})", path.display()))?;
        let seed_bytes = hex::decode(content.trim()).context("corrupt key file: not valid hex")?;
        let seed: [u8; 32] = seed_bytes
            .try_into()
            .map_err(|_| anyhow!("corrupt key file: expected 32 bytes"))?;
        let (pk, sk) = SecretKey::from_seed(seed);
        Ok((pk, sk))
    }

    /// List the names of every stored key.
    pub fn list(&self) -> Result<Vec<String>> {
        self.ensure_dir()?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("key") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_load_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = KeyStore::new(tmp.path());

        let pk = store.generate("a").unwrap();
        let (loaded_pk, _sk) = store.load("a").unwrap();
        assert_eq!(pk, loaded_pk);
    }

    #[test]
    fn duplicate_name_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let store = KeyStore::new(tmp.path());
        store.generate("dup").unwrap();
        assert!(store.generate("dup").is_err());
    }

    #[test]
    fn list_reflects_generated_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let store = KeyStore::new(tmp.path());
        store.generate("a").unwrap();
        store.generate("b").unwrap();
        assert_eq!(store.list().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
