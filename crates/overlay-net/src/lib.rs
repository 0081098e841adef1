//! Overlay network transport client core.
//!
//! Public-key-addressed visors dial and listen on virtual overlay ports
//! multiplexed over a single OS-level carrier connection (STCP, STCPR or
//! SUDPH). Every connection is mutually authenticated by a three-frame
//! handshake before the caller ever sees a byte.

pub mod addrresolver;
pub mod carriers;
pub mod client;
pub mod config;
pub mod conn;
pub mod event;
pub mod handshake;
mod latch;
pub mod listener;
pub mod pktable;
pub mod porter;

pub use client::{ClientFactory, GenericClient};
pub use config::ClientConfig;
pub use conn::WrappedConn;
pub use listener::Listener;
pub use porter::{PortLease, Porter, MIN_EPHEMERAL};

pub use overlay_core::{CarrierType, HandshakeError, NetworkError, NetworkResult, OverlayAddress, PublicKey, SecretKey};
