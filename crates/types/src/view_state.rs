//! Persisted view state and the protocol state handed to consensus.

use crate::{Block, Hash, Phase, QuorumCertificate};
use serde::{Deserialize, Serialize};

/// The durable consensus state of one node.
///
/// Exactly one bundle is persisted per node and it is always updated
/// atomically as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewStateBundle {
    pub view_number: u64,
    pub prepare_qc: QuorumCertificate,
    pub locked_qc: QuorumCertificate,
    pub commit_qc: QuorumCertificate,
    pub root_block_hash: Hash,
    pub last_executed_block_hash: Hash,
}

impl ViewStateBundle {
    /// The bundle seeded for a fresh node: view 0, all three certificates
    /// pointing at genesis with empty aggregates, root and last-executed
    /// both at genesis.
    pub fn genesis(genesis_hash: Hash) -> Self {
        ViewStateBundle {
            view_number: 0,
            prepare_qc: QuorumCertificate::genesis(genesis_hash),
            locked_qc: QuorumCertificate::genesis(genesis_hash),
            commit_qc: QuorumCertificate::genesis(genesis_hash),
            root_block_hash: genesis_hash,
            last_executed_block_hash: genesis_hash,
        }
    }
}

/// The state the consensus machine starts from.
///
/// On a restart this is derived from the persisted bundle: the view is
/// advanced once and the phase reset to Prepare, which is always safe
/// because a fresh round begins with no prior votes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolState {
    pub view_number: u64,
    pub phase: Phase,
    pub prepare_qc: QuorumCertificate,
    pub locked_qc: QuorumCertificate,
    pub commit_qc: QuorumCertificate,
    pub prepared_block: Block,
}
