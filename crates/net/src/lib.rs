//! Static-topology overlay networking for the gridbot federation.
//!
//! This crate maintains at most one live, mutually authenticated connection
//! to each federation peer and multiplexes inbound traffic into a single
//! ordered stream:
//!
//! - [`TlsConnectionProvider`]: dials and accepts framed TLS channels keyed
//!   by peer public key
//! - [`ConnectionsRegister`]: the one-connection-per-peer invariant
//! - [`ConnectionManager`]: dialer, acceptor, and read-multiplexer loops
//!   with infinite exponential-backoff retry
//!
//! # Architecture
//!
//! ```text
//! dial queue ──► Dialer ──┐                    ┌──► reader task ──┐
//!                         ├──► Register ──► ───┤    (one per      ├──► inbound queue
//! listener ───► Acceptor ─┘                    └──► connection)  ──┘   (key, frame)
//! ```
//!
//! Simultaneous dial/accept between two peers ("glare") is resolved at the
//! register: whichever connection registers first wins, the loser is closed
//! by its producer.

mod codec;
mod error;
mod manager;
mod provider;
mod register;
mod tls;

pub use codec::{read_frame, write_frame, MAX_FRAME_LEN};
pub use error::NetworkError;
pub use manager::{ConnectionManager, ConnectionRequest, RetryPolicy};
pub use provider::{AcceptedConnection, Connection, Direction, TlsConnectionProvider};
pub use register::ConnectionsRegister;

/// Default capacity of a connection's inbound frame queue.
pub const DEFAULT_INBOUND_QUEUE: usize = 100;
