//! Wire structures for the three-frame mutual-authentication handshake.
//!
//! The layout is fixed width and hand-framed (see [`crate::codec`]) rather
//! than a self-describing format: the handshake runs before any shared
//! session key exists, so it has to be unambiguous without relying on a
//! schema negotiation step.

/// Bumped whenever a wire-incompatible change is made to the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

use crate::identity::OverlayAddress;
use crate::keys::PublicKey;

/// Frame 1, sent by the initiator: who it is, who it believes it's dialing,
/// and a fresh nonce both sides will sign over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFrame1 {
    pub version: u8,
    pub initiator: OverlayAddress,
    pub responder_pk: PublicKey,
    pub responder_port: u16,
    pub nonce: [u8; 24],
}

/// Frame 2, the responder's reply: proof of possession of `responder_pk`
/// over the transcript so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFrame2 {
    pub signature: [u8; 64],
}

/// Frame 3, the initiator's final proof of possession, completing mutual
/// authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFrame3 {
    pub signature: [u8; 64],
}

impl HandshakeFrame1 {
    /// The byte string both peers sign over: everything in frame 1 except
    /// the version byte, which is negotiated out of band of the signature.
    pub fn transcript(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + 2 + 32 + 2 + 24);
        buf.extend_from_slice(self.initiator.pk.as_bytes());
        buf.extend_from_slice(&self.initiator.port.to_be_bytes());
        buf.extend_from_slice(self.responder_pk.as_bytes());
        buf.extend_from_slice(&self.responder_port.to_be_bytes());
        buf.extend_from_slice(&self.nonce);
        buf
    }
}
