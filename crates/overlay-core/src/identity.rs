//! Overlay-level addressing: the (public key, port) pair that identifies a
//! listening endpoint on a visor, and the tag distinguishing which carrier a
//! transport was dialed or accepted over.

use crate::keys::PublicKey;
use std::fmt;
use std::str::FromStr;

/// The address of an endpoint on the overlay network: a visor's public key
/// plus a virtual port local to that visor. Unlike an OS-level socket
/// address, the same overlay port can be reached over any carrier the
/// visor has configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OverlayAddress {
    pub pk: PublicKey,
    pub port: u16,
}

impl OverlayAddress {
    pub fn new(pk: PublicKey, port: u16) -> Self {
        Self { pk, port }
    }
}

impl fmt::Display for OverlayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pk, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseOverlayAddressError {
    #[error("expected `pk:port`, got `{0}`")]
    Malformed(String),
    #[error("invalid public key: {0}")]
    BadKey(#[from] hex::FromHexError),
    #[error("invalid port: {0}")]
    BadPort(#[from] std::num::ParseIntError),
}

impl FromStr for OverlayAddress {
    type Err = ParseOverlayAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pk_s, port_s) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseOverlayAddressError::Malformed(s.to_string()))?;
        let pk: PublicKey = pk_s.parse()?;
        let port: u16 = port_s.parse()?;
        Ok(Self { pk, port })
    }
}

/// Which wire-level carrier a connection runs over. Carriers share the same
/// handshake and framing but differ in how the initial socket gets
/// established (direct dial, resolver-assisted TCP, or UDP hole punching).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CarrierType {
    /// Direct TCP to a statically configured peer table entry.
    Stcp,
    /// TCP dialed via an address resolver, with candidate-address fallback.
    Stcpr,
    /// UDP with resolver-coordinated hole punching.
    Sudph,
}

impl CarrierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CarrierType::Stcp => "stcp",
            CarrierType::Stcpr => "stcpr",
            CarrierType::Sudph => "sudph",
        }
    }
}

impl fmt::Display for CarrierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown carrier type `{0}`")]
pub struct ParseCarrierTypeError(String);

impl FromStr for CarrierType {
    type Err = ParseCarrierTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stcp" => Ok(CarrierType::Stcp),
            "stcpr" => Ok(CarrierType::Stcpr),
            "sudph" => Ok(CarrierType::Sudph),
            other => Err(ParseCarrierTypeError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_address_roundtrip() {
        let (pk, _sk) = crate::keys::SecretKey::generate();
        let addr = OverlayAddress::new(pk, 49152);
        let s = addr.to_string();
        let parsed: OverlayAddress = s.parse().unwrap();
        assert_eq!(addr, parsed);
    }

    #[test]
    fn carrier_type_roundtrip() {
        for ct in [CarrierType::Stcp, CarrierType::Stcpr, CarrierType::Sudph] {
            let parsed: CarrierType = ct.as_str().parse().unwrap();
            assert_eq!(ct, parsed);
        }
    }

    #[test]
    fn rejects_unknown_carrier() {
        assert!("quic".parse::<CarrierType>().is_err());
    }
}
