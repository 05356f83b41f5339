//! Blocks.

use crate::{Hash, RobotCommand, RobotState};
use serde::{Deserialize, Serialize};

/// A consensus block: one replicated command and the hash of the
/// application state after applying it.
///
/// A block's identity is the content hash of its encoding. The genesis
/// block has [`Hash::ZERO`] as its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Hash of the parent block, `Hash::ZERO` for genesis.
    pub parent: Hash,
    /// Hash of the application state after executing `command`.
    pub post_state: Hash,
    /// The replicated command.
    pub command: RobotCommand,
}

impl Block {
    pub fn new(parent: Hash, post_state: Hash, command: RobotCommand) -> Self {
        Block {
            parent,
            post_state,
            command,
        }
    }

    /// The genesis block. Deterministic: every node computes the same one.
    pub fn genesis() -> Self {
        Block {
            parent: Hash::ZERO,
            post_state: RobotState::initial().state_hash(),
            command: RobotCommand::Stay,
        }
    }

    /// Content hash identifying this block.
    pub fn hash(&self) -> Hash {
        let bytes = bincode::serialize(self).expect("block serialization is infallible");
        Hash::digest(&bytes)
    }
}
