//! Network error kinds.

use gridbot_types::PeerKey;

/// Errors from the overlay network.
///
/// Network errors are recoverable and confined to the affected connection:
/// dial failures are retried forever, terminal connection errors trigger a
/// deregister-and-redial cycle.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The TLS handshake failed or the peer did not prove possession of the
    /// expected key.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// An outbound TCP connection could not be established.
    #[error("dial failed: {0}")]
    Dial(String),

    /// The remote closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// A send was attempted on a connection that already terminated.
    #[error("send on closed connection to {0}")]
    SendOnClosedConnection(PeerKey),

    /// A frame exceeded the maximum permitted length.
    #[error("frame of {0} bytes exceeds the 1 MiB limit")]
    FrameTooLarge(usize),

    /// The presented certificate did not contain a usable identity key.
    #[error("invalid peer certificate: {0}")]
    InvalidPeerCertificate(String),

    /// The manager is shutting down.
    #[error("network shutdown")]
    Shutdown,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
