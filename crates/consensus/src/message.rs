//! Consensus wire messages.

use gridbot_types::{Block, Hash, Phase, QuorumCertificate, Signature};
use serde::{Deserialize, Serialize};

/// Messages exchanged between federation members.
///
/// The sender's identity is not carried here; it is bound by the
/// authenticated transport and attached by the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    /// A replica announces it entered `view_number`, handing the leader
    /// its highest prepare certificate together with the block that
    /// certificate covers, so a leader that fell behind can adopt both.
    NewView {
        view_number: u64,
        prepare_qc: QuorumCertificate,
        prepared_block: Block,
    },

    /// The leader drives one phase of the round. For `Prepare` the
    /// justification is the high certificate the block extends; for later
    /// phases it is the certificate formed by the previous phase's votes.
    Proposal {
        view_number: u64,
        phase: Phase,
        block: Block,
        justify: QuorumCertificate,
    },

    /// A phase vote, signed over `(phase, view_number, block_hash)`.
    Vote {
        view_number: u64,
        phase: Phase,
        block_hash: Hash,
        signature: Signature,
    },

    /// The leader announces the commit certificate; receivers execute.
    Decide {
        view_number: u64,
        block_hash: Hash,
        commit_qc: QuorumCertificate,
    },
}

impl ConsensusMessage {
    /// Short name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            ConsensusMessage::NewView { .. } => "new_view",
            ConsensusMessage::Proposal { .. } => "proposal",
            ConsensusMessage::Vote { .. } => "vote",
            ConsensusMessage::Decide { .. } => "decide",
        }
    }

    /// The view this message belongs to.
    pub fn view_number(&self) -> u64 {
        match self {
            ConsensusMessage::NewView { view_number, .. }
            | ConsensusMessage::Proposal { view_number, .. }
            | ConsensusMessage::Vote { view_number, .. }
            | ConsensusMessage::Decide { view_number, .. } => *view_number,
        }
    }
}
