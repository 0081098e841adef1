use thiserror::Error;

/// Errors produced while running the three-frame handshake.
///
/// Distinguishable from transport-level I/O errors so the accept loop can
/// decide whether a failure is "this peer misbehaved, keep serving others"
/// (any variant but [`HandshakeError::Io`]) or "the connection died under
/// us" (`Io`).
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("no listener on requested overlay port")]
    NoListener,

    #[error("responder public key in frame did not match local identity")]
    WrongPeer,

    #[error("handshake timed out")]
    Timeout,

    #[error("malformed handshake frame: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    /// Whether this is a classified handshake failure (as opposed to a raw
    /// I/O error indicating the underlying stream died). Accept loops use
    /// this to decide whether to keep serving other connections.
    pub fn is_handshake_error(&self) -> bool {
        !matches!(self, HandshakeError::Io(_))
    }
}

/// Errors surfaced across the `Client`/`Listener`/`WrappedConn` boundary.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("overlay port already occupied")]
    PortOccupied,

    #[error("not listening")]
    NotListening,

    #[error("closed")]
    Closed,

    #[error("handshake failed: {0}")]
    HandshakeFailed(#[from] HandshakeError),

    #[error("address resolution failed: {0}")]
    ResolveFailed(String),

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl NetworkError {
    /// True when this error originated from the handshake state machine
    /// rather than from a dead OS-level listener. Mirrors
    /// [`HandshakeError::is_handshake_error`] at the client boundary.
    pub fn is_handshake_error(&self) -> bool {
        matches!(self, NetworkError::HandshakeFailed(e) if e.is_handshake_error())
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;
