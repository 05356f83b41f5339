//! # Persistent storage
//!
//! RocksDB-backed persistence for the node, organized as byte-tagged
//! namespaces (column families):
//!
//! - [`BlockStore`]: content-addressed block DAG with parent/children
//!   indices and descendant-preserving pruning
//! - [`ViewStateStore`]: the single durable [`ViewStateBundle`]
//! - [`StateRing`]: bounded FIFO ring of application-state snapshots
//!
//! All operations are synchronous blocking I/O. Callers in async contexts
//! should use `spawn_blocking` if needed to avoid blocking the runtime.
//!
//! Every mutation is routed through [`Database::write_ops`], which commits
//! one atomic `WriteBatch`; multi-store transactions (pruning) compose ops
//! from several stores into a single batch.
//!
//! [`ViewStateBundle`]: gridbot_types::ViewStateBundle

mod block_store;
mod db;
mod state_ring;
mod view_store;

pub use block_store::BlockStore;
pub use db::{Database, Namespace, StorageError, WriteOp};
pub use state_ring::StateRing;
pub use view_store::ViewStateStore;
