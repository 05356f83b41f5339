//! Quorum certificates.

use crate::{Federation, Hash, KeyPair, PeerKey, Signature};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Domain separator for vote signing messages.
const DOMAIN_VOTE: &[u8] = b"gridbot/vote/v1:";

/// Protocol phase of a consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Prepare,
    PreCommit,
    Commit,
    Decide,
}

impl Phase {
    fn tag(self) -> u8 {
        match self {
            Phase::Prepare => 0,
            Phase::PreCommit => 1,
            Phase::Commit => 2,
            Phase::Decide => 3,
        }
    }
}

/// A collection of `(signer, signature)` pairs over the same payload.
///
/// The genesis certificates carry an empty aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregateSignature {
    entries: Vec<(PeerKey, Signature)>,
}

impl AggregateSignature {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a signature. Duplicate signers are ignored.
    pub fn add(&mut self, signer: PeerKey, signature: Signature) {
        if !self.entries.iter().any(|(k, _)| *k == signer) {
            self.entries.push((signer, signature));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn signers(&self) -> impl Iterator<Item = &PeerKey> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn entries(&self) -> &[(PeerKey, Signature)] {
        &self.entries
    }
}

/// An aggregated vote by a supermajority of the federation over
/// `(phase, view_number, block_hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    pub phase: Phase,
    pub view_number: u64,
    pub block_hash: Hash,
    pub signatures: AggregateSignature,
}

impl QuorumCertificate {
    pub fn new(phase: Phase, view_number: u64, block_hash: Hash) -> Self {
        QuorumCertificate {
            phase,
            view_number,
            block_hash,
            signatures: AggregateSignature::empty(),
        }
    }

    /// The certificate seeded for a fresh node: Prepare at view 0 over the
    /// genesis block, with an empty aggregate.
    pub fn genesis(genesis_hash: Hash) -> Self {
        Self::new(Phase::Prepare, 0, genesis_hash)
    }

    /// The byte string votes for this certificate sign.
    pub fn signing_message(phase: Phase, view_number: u64, block_hash: &Hash) -> Vec<u8> {
        let mut msg = Vec::with_capacity(DOMAIN_VOTE.len() + 1 + 8 + 32);
        msg.extend_from_slice(DOMAIN_VOTE);
        msg.push(phase.tag());
        msg.extend_from_slice(&view_number.to_be_bytes());
        msg.extend_from_slice(block_hash.as_bytes());
        msg
    }

    /// Sign this certificate's payload with a node key.
    pub fn sign_vote(&self, keypair: &KeyPair) -> Signature {
        keypair.sign(&Self::signing_message(
            self.phase,
            self.view_number,
            &self.block_hash,
        ))
    }

    /// Check that the aggregate carries a quorum of valid federation
    /// signatures over this certificate's payload.
    ///
    /// View-0 certificates with an empty aggregate are the seeded genesis
    /// certificates and are accepted as the trust anchor.
    pub fn is_valid(&self, federation: &Federation) -> bool {
        if self.view_number == 0 && self.signatures.is_empty() {
            return true;
        }

        let message = Self::signing_message(self.phase, self.view_number, &self.block_hash);
        let mut valid: BTreeSet<PeerKey> = BTreeSet::new();
        for (signer, signature) in self.signatures.entries() {
            if !federation.contains(signer) {
                return false;
            }
            if signer.verify(&message, signature).is_err() {
                return false;
            }
            valid.insert(*signer);
        }
        valid.len() >= federation.quorum_threshold()
    }
}
