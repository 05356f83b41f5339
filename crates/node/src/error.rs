//! Node-level errors.

use crate::ConfigError;
use gridbot_net::NetworkError;
use gridbot_storage::StorageError;

/// Errors from node composition and the runner loop.
///
/// Storage errors are fatal: once a persistence invariant is in doubt,
/// consensus safety cannot be guaranteed and the process exits. Network
/// errors never surface here; they are retried inside the overlay.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("network setup failed: {0}")]
    Network(#[from] NetworkError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("storage corruption: {0}")]
    StorageCorruption(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
