//! Ed25519 identity keys and the static X25519 keys derived from them.
//!
//! Every visor has a single long-term Ed25519 keypair. The same keypair is
//! used for two purposes: signing handshake nonces (proof of possession) and
//! -- via the standard Ed25519-to-X25519 birational map -- deriving the
//! static Curve25519 keys used for the AEAD session-key agreement in
//! [`crate::codec`]. No separate ephemeral DH exchange is needed: the
//! Montgomery-form public point can be recovered from the Ed25519 public key
//! alone, and the corresponding scalar from `SHA-512(seed)[..32]` clamped the
//! same way `ed25519-dalek` derives its own expanded secret key.

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha512};
use std::fmt;
use std::str::FromStr;

/// A 32-byte Ed25519 public key identifying a visor on the overlay network.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn verifying_key(&self) -> Result<VerifyingKey, ed25519_dalek::SignatureError> {
        VerifyingKey::from_bytes(&self.0)
    }

    /// Verify a signature produced by the holder of the matching secret key.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        let Ok(vk) = self.verifying_key() else {
            return false;
        };
        let sig = Signature::from_bytes(signature);
        vk.verify(message, &sig).is_ok()
    }

    /// Derive the static X25519 public point used for AEAD key agreement.
    pub(crate) fn to_x25519(&self) -> Option<x25519_dalek::PublicKey> {
        let compressed = CompressedEdwardsY(self.0);
        let edwards = compressed.decompress()?;
        let montgomery = edwards.to_montgomery();
        Some(x25519_dalek::PublicKey::from(montgomery.to_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for PublicKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A visor's long-term Ed25519 secret key.
pub struct SecretKey(SigningKey);

impl SecretKey {
    /// Generate a fresh random keypair.
    pub fn generate() -> (PublicKey, SecretKey) {
        let mut rng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut rng);
        let pk = PublicKey(signing_key.verifying_key().to_bytes());
        (pk, SecretKey(signing_key))
    }

    /// Reconstruct from a 32-byte seed (e.g. loaded from a key file).
    pub fn from_seed(seed: [u8; 32]) -> (PublicKey, SecretKey) {
        let signing_key = SigningKey::from_bytes(&seed);
        let pk = PublicKey(signing_key.verifying_key().to_bytes());
        (pk, SecretKey(signing_key))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    pub fn seed(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Sign a message, producing a proof of possession over a handshake
    /// nonce.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.0.sign(message).to_bytes()
    }

    /// Derive the static X25519 secret scalar for AEAD key agreement.
    pub(crate) fn to_x25519(&self) -> x25519_dalek::StaticSecret {
        let hash = Sha512::digest(self.0.to_bytes());
        let mut scalar_bytes = [0u8; 32];
        scalar_bytes.copy_from_slice(&hash[..32]);
        scalar_bytes[0] &= 248;
        scalar_bytes[31] &= 127;
        scalar_bytes[31] |= 64;
        x25519_dalek::StaticSecret::from(scalar_bytes)
    }

    /// Compute the shared AEAD transport secret with a remote visor's
    /// public key. Both sides of a connection arrive at the same value
    /// because X25519 DH is commutative.
    pub(crate) fn diffie_hellman(&self, remote: &PublicKey) -> Option<[u8; 32]> {
        let remote_x25519 = remote.to_x25519()?;
        Some(self.to_x25519().diffie_hellman(&remote_x25519).to_bytes())
    }
}

impl Clone for SecretKey {
    fn clone(&self) -> Self {
        SecretKey(SigningKey::from_bytes(&self.0.to_bytes()))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let (pk, sk) = SecretKey::generate();
        let msg = b"handshake-nonce";
        let sig = sk.sign(msg);
        assert!(pk.verify(msg, &sig));
    }

    #[test]
    fn tampered_signature_fails() {
        let (pk, sk) = SecretKey::generate();
        let mut sig = sk.sign(b"hello");
        sig[0] ^= 0xff;
        assert!(!pk.verify(b"hello", &sig));
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let (pk, _sk) = SecretKey::generate();
        let s = pk.to_string();
        let parsed: PublicKey = s.parse().unwrap();
        assert_eq!(pk, parsed);
    }

    #[test]
    fn diffie_hellman_is_symmetric() {
        let (pk_a, sk_a) = SecretKey::generate();
        let (pk_b, sk_b) = SecretKey::generate();
        let shared_a = sk_a.diffie_hellman(&pk_b).unwrap();
        let shared_b = sk_b.diffie_hellman(&pk_a).unwrap();
        assert_eq!(shared_a, shared_b);
    }
}
