//! overlay-core: shared protocol primitives for the overlay network client.
//!
//! Provides the handshake wire types, public/secret key handling, overlay
//! address and carrier-type tags, AEAD record framing, and the error
//! taxonomy shared between the carrier drivers and the generic client core.

pub mod codec;
pub mod error;
pub mod identity;
pub mod keys;
pub mod messages;

pub use error::{HandshakeError, NetworkError, NetworkResult};
pub use identity::{CarrierType, OverlayAddress};
pub use keys::{PublicKey, SecretKey};
pub use messages::PROTOCOL_VERSION;
