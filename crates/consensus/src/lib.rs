//! HotStuff consensus state machine.
//!
//! The protocol is implemented as a synchronous event-driven machine:
//!
//! ```text
//! Events → HotStuffMachine::handle() → Actions
//! ```
//!
//! The machine is:
//! - **Synchronous**: no async, no `.await`
//! - **Deterministic**: same state + event = same actions
//! - **Pure-ish**: mutates itself, but performs no I/O
//!
//! All I/O belongs to the runner, which delivers events (network messages,
//! timer fires, application commands) and executes the returned actions
//! (sends, persistence, block execution, timer scheduling).
//!
//! # Protocol
//!
//! Three-round HotStuff with a rotating leader:
//!
//! - On entering view `v` every replica sends `NewView` carrying its
//!   highest prepare certificate and the block it covers to the leader
//!   of `v`.
//! - The leader gathers a quorum of `NewView`s, adopting the highest
//!   carried certificate as its prepared tip, waits for an application
//!   command, and broadcasts a `Prepare` proposal extending that tip.
//! - Replicas vote phase by phase (`Prepare → PreCommit → Commit`); each
//!   quorum of votes forms a certificate that the leader re-broadcasts to
//!   open the next phase.
//! - The commit certificate is announced with `Decide`; everyone executes
//!   the block and enters view `v + 1`.
//! - A view timeout advances to the next view with an exponentially grown
//!   timeout; a decision resets the backoff.

mod codec;
mod config;
mod machine;
mod message;

pub use codec::{decode_message, encode_message, CodecError, WIRE_VERSION};
pub use config::ConsensusConfig;
pub use machine::{Action, Event, HotStuffMachine};
pub use message::ConsensusMessage;
