//! Core types for the gridbot consensus node.
//!
//! This crate provides the foundational types used throughout the node:
//!
//! - **Primitives**: [`Hash`], keys and signatures
//! - **Identity**: [`PeerKey`], [`PeerAddress`], the [`Federation`] table
//! - **Consensus types**: [`Block`], [`QuorumCertificate`], [`Phase`],
//!   [`ViewStateBundle`], [`ProtocolState`]
//! - **Application model**: [`RobotState`] and [`RobotCommand`]
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod block;
mod federation;
mod hash;
mod keys;
mod quorum_certificate;
mod robot;
mod view_state;

pub use block::Block;
pub use federation::{Federation, FederationEntry, PeerAddress};
pub use hash::{Hash, HexError};
pub use keys::{KeyError, KeyPair, PeerKey, Signature, PEER_KEY_LEN};
pub use quorum_certificate::{AggregateSignature, Phase, QuorumCertificate};
pub use robot::{GridLimits, RobotCommand, RobotState};
pub use view_state::{ProtocolState, ViewStateBundle};
