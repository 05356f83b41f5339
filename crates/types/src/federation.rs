//! The static federation table.

use crate::PeerKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A peer's network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        PeerAddress {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One federation member: identity key and server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationEntry {
    pub key: PeerKey,
    pub address: PeerAddress,
}

/// The fixed, ordered set of validating peers.
///
/// Every node knows the full table; the ordering drives leader rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Federation {
    entries: Vec<FederationEntry>,
}

impl Federation {
    pub fn new(entries: Vec<FederationEntry>) -> Self {
        Federation { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[FederationEntry] {
        &self.entries
    }

    pub fn contains(&self, key: &PeerKey) -> bool {
        self.entries.iter().any(|e| e.key == *key)
    }

    /// The configured server address for a member, if it is one.
    pub fn address_of(&self, key: &PeerKey) -> Option<&PeerAddress> {
        self.entries.iter().find(|e| e.key == *key).map(|e| &e.address)
    }

    /// All members except `local`.
    pub fn others<'a>(&'a self, local: &'a PeerKey) -> impl Iterator<Item = &'a FederationEntry> {
        self.entries.iter().filter(move |e| e.key != *local)
    }

    /// Round-robin leader for a view.
    pub fn leader_for_view(&self, view_number: u64) -> &PeerKey {
        let idx = (view_number % self.entries.len() as u64) as usize;
        &self.entries[idx].key
    }

    /// Number of distinct signers required for a quorum: `n - f` where
    /// `f = (n - 1) / 3`.
    pub fn quorum_threshold(&self) -> usize {
        let n = self.entries.len();
        n - (n.saturating_sub(1)) / 3
    }
}
